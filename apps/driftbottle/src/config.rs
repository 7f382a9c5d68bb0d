use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "driftbottle",
    author,
    version,
    about = "Anonymous 1:1 chat pairing relay"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind the websocket listener to.
    #[arg(long, env = "DRIFTBOTTLE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Redis connection URI, used for rooms, message history, and the
    /// cross-instance pub/sub channel.
    #[arg(long, env = "DRIFTBOTTLE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Per-session outbound queue depth.
    #[arg(long, env = "DRIFTBOTTLE_OUTBOUND_DEPTH", default_value_t = 256)]
    outbound_depth: usize,

    /// Depth of the instance-wide publish queue feeding the broker.
    #[arg(long, env = "DRIFTBOTTLE_PUBLISH_DEPTH", default_value_t = 4096)]
    publish_depth: usize,

    /// Depth of the matchmaking command queue.
    #[arg(long, env = "DRIFTBOTTLE_MATCH_DEPTH", default_value_t = 1024)]
    match_depth: usize,

    /// Interval between keepalive pings on each connection.
    #[arg(long, env = "DRIFTBOTTLE_KEEPALIVE_SECS", default_value_t = 54)]
    keepalive_secs: u64,

    /// Per-frame socket write deadline before the connection is declared dead.
    #[arg(long, env = "DRIFTBOTTLE_WRITE_TIMEOUT_SECS", default_value_t = 10)]
    write_timeout_secs: u64,

    /// Inbound-silence window after which a session is reaped.
    #[arg(long, env = "DRIFTBOTTLE_IDLE_TIMEOUT_SECS", default_value_t = 150)]
    idle_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "DRIFTBOTTLE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect as an interactive chat client (for poking at a running server).
    Debug {
        /// Server URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Identity to connect as.
        #[arg(short = 'U', long)]
        user: String,

        /// Pairing criteria; omit to re-enter an existing room.
        #[arg(short, long)]
        want: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub outbound_depth: usize,
    pub publish_depth: usize,
    pub match_depth: usize,
    pub keepalive: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url,
            outbound_depth: cli.outbound_depth,
            publish_depth: cli.publish_depth,
            match_depth: cli.match_depth,
            keepalive: Duration::from_secs(cli.keepalive_secs),
            write_timeout: Duration::from_secs(cli.write_timeout_secs),
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
