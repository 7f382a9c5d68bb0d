mod broker;
mod cli;
mod config;
mod fanout;
mod matchmaker;
mod protocol;
mod registry;
mod session;
mod storage;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use clap::Parser;
use drift_bus::Bus;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::json;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::broker::RedisBus;
use crate::config::{Cli, Commands, ServerConfig};
use crate::fanout::CHAT_TOPIC;
use crate::matchmaker::Matchmaker;
use crate::registry::ConnectionRegistry;
use crate::storage::{MessageArchive, RedisStore, RoomStore};
use crate::websocket::{websocket_handler, RelayState};

const REAPER_INTERVAL: Duration = Duration::from_secs(30);

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if let Some(Commands::Debug { url, user, want }) = cli.command {
        if let Err(err) = cli::run_debug_client(url, user, want).await {
            error!("debug client error: {err:#}");
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        redis_url = %config.redis_url,
        "starting driftbottle relay"
    );
    run(config).await
}

async fn run(config: ServerConfig) -> Result<()> {
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let store = RedisStore::connect(&config.redis_url)
        .await
        .context("failed to connect to redis")?;
    let rooms: Arc<dyn RoomStore> = Arc::new(store.clone());
    let archive: Arc<dyn MessageArchive> = Arc::new(store);

    let bus: Arc<dyn Bus> = Arc::new(
        RedisBus::connect(
            &config.redis_url,
            &[CHAT_TOPIC],
            config.publish_depth,
            config.publish_depth,
        )
        .await
        .context("failed to connect redis pub/sub")?,
    );

    let registry = ConnectionRegistry::new();
    let _reaper = registry.spawn_reaper(REAPER_INTERVAL, config.idle_timeout);

    let (matchmaker_handle, matchmaker) = Matchmaker::new(rooms.clone(), config.match_depth);
    tokio::spawn(matchmaker.run());

    let (publish_tx, _publish_task, _subscribe_task) = fanout::spawn(
        bus,
        registry.clone(),
        archive,
        config.publish_depth,
    );

    let state = RelayState {
        registry,
        matchmaker: matchmaker_handle,
        rooms,
        publish: publish_tx,
        outbound_depth: config.outbound_depth,
        keepalive: config.keepalive,
        write_timeout: config.write_timeout,
    };

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/healthz", get(health_handler))
        .route(
            "/metrics",
            get(move || std::future::ready(metrics_handle.render())),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("driftbottle listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
