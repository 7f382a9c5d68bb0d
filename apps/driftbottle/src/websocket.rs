use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::matchmaker::{Criteria, MatchmakerHandle};
use crate::protocol::{BusEnvelope, ErrorKind, ServerFrame};
use crate::registry::ConnectionRegistry;
use crate::session::{run_read_pump, run_write_pump, teardown, Session};
use crate::storage::{RoomLookup, RoomStore};

/// Everything a connection needs from the rest of the instance.
#[derive(Clone)]
pub struct RelayState {
    pub registry: ConnectionRegistry,
    pub matchmaker: MatchmakerHandle,
    pub rooms: Arc<dyn RoomStore>,
    pub publish: mpsc::Sender<BusEnvelope>,
    pub outbound_depth: usize,
    pub keepalive: Duration,
    pub write_timeout: Duration,
}

/// Identity comes resolved from the auth layer in front of this service;
/// `want` is only required when a new pairing is needed.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub user: Option<String>,
    pub want: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn handle_socket(mut socket: WebSocket, query: ConnectQuery, state: RelayState) {
    let Some(user_id) = query.user.filter(|user| !user.trim().is_empty()) else {
        reject(&mut socket, ErrorKind::MissingIdentity).await;
        return;
    };

    let lookup = match state.rooms.find_by_user(&user_id).await {
        Ok(lookup) => lookup,
        Err(err) => {
            error!(user = %user_id, error = %err, "room lookup failed");
            reject(&mut socket, ErrorKind::LookupFailed).await;
            return;
        }
    };

    let criteria = query.want.as_deref().map(Criteria::parse);
    let prior_room_closed = matches!(lookup, RoomLookup::Closed(_));
    let resume = match lookup {
        RoomLookup::Found(room) => match room.partner_of(&user_id) {
            Some(partner) => Some((room.id, partner.to_string())),
            None => {
                error!(user = %user_id, room = %room.id, "room index out of step with room record");
                reject(&mut socket, ErrorKind::LookupFailed).await;
                return;
            }
        },
        RoomLookup::Closed(_) | RoomLookup::NotFound => None,
    };
    // A fresh pairing needs criteria up front; re-entry does not.
    if resume.is_none() && criteria.is_none() {
        reject(&mut socket, ErrorKind::MissingCriteria).await;
        return;
    }

    let (session, outbound_rx) = Session::new(
        user_id.clone(),
        criteria.unwrap_or(Criteria::Any),
        state.outbound_depth,
    );
    state.registry.register(session.clone());
    info!(user = %user_id, conn = %session.conn_id(), "session connected");

    match resume {
        Some((room_id, partner)) => {
            session.mark_paired(room_id, partner);
            session.enqueue(ServerFrame::InRoom { room_id });
        }
        None => {
            if prior_room_closed {
                session.enqueue(ServerFrame::RoomClosed);
            }
            session.enqueue(ServerFrame::Pairing);
            if !state.matchmaker.enqueue(session.clone()).await {
                error!(user = %user_id, "matchmaker unavailable");
                session.cancel();
            }
        }
    }

    let (ws_sender, ws_receiver) = socket.split();
    let write_task = tokio::spawn(run_write_pump(
        session.clone(),
        ws_sender,
        outbound_rx,
        state.keepalive,
        state.write_timeout,
    ));
    let read_task = tokio::spawn(run_read_pump(
        session.clone(),
        ws_receiver,
        state.publish.clone(),
    ));
    let _ = tokio::join!(read_task, write_task);

    teardown(
        &session,
        &state.registry,
        &state.matchmaker,
        &state.rooms,
        &state.publish,
    )
    .await;
}

/// Protocol violation before the session exists: say why, then close. The
/// pumps are not running yet, so write straight to the socket.
async fn reject(socket: &mut WebSocket, kind: ErrorKind) {
    let frame = ServerFrame::Error { kind };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}
