use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::matchmaker::{Criteria, MatchmakerHandle};
use crate::protocol::{BusEnvelope, ClientFrame, ErrorKind, ServerFrame, UserId};
use crate::registry::ConnectionRegistry;
use crate::storage::RoomStore;

/// Room/partner assignment. Set exactly once for the life of a pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct Pairing {
    pub room_id: Uuid,
    pub partner: UserId,
}

/// In-process state for one connected client. The connection task owns the
/// socket; the registry and matchmaker hold `Arc` references that go away
/// during teardown. The cancellation token is shared by both pumps and is
/// the sole mechanism for unwinding them.
pub struct Session {
    user_id: UserId,
    conn_id: Uuid,
    criteria: Criteria,
    outbound: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
    pairing: parking_lot::RwLock<Option<Pairing>>,
    last_seen: AtomicU64,
    torn_down: AtomicBool,
}

impl Session {
    pub fn new(
        user_id: UserId,
        criteria: Criteria,
        outbound_depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(outbound_depth);
        let session = Arc::new(Self {
            user_id,
            conn_id: Uuid::new_v4(),
            criteria,
            outbound: tx,
            cancel: CancellationToken::new(),
            pairing: parking_lot::RwLock::new(None),
            last_seen: AtomicU64::new(now_millis()),
            torn_down: AtomicBool::new(false),
        });
        (session, rx)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Unique per physical connection; a reconnect by the same user gets a
    /// fresh one, which is how stale teardowns are told apart.
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Records the pairing. Returns false if the session is already paired
    /// or already being torn down, in which case nothing changes — a
    /// session never ends up in two rooms.
    pub fn mark_paired(&self, room_id: Uuid, partner: UserId) -> bool {
        if self.torn_down.load(Ordering::SeqCst) {
            return false;
        }
        let mut guard = self.pairing.write();
        if guard.is_some() {
            return false;
        }
        *guard = Some(Pairing { room_id, partner });
        true
    }

    pub fn pairing(&self) -> Option<Pairing> {
        self.pairing.read().clone()
    }

    /// Non-blocking enqueue onto the outbound queue. A full queue drops the
    /// frame (counted) rather than stalling the caller — the subscribe pump
    /// must never wait on a slow client.
    pub fn enqueue(&self, frame: ServerFrame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                counter!(
                    "driftbottle_outbound_dropped_total",
                    1,
                    "user_id" => self.user_id.clone()
                );
                warn!(user = %self.user_id, "outbound queue full; dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn touch(&self) {
        self.last_seen.store(now_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_seen.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Decode inbound frames and feed the fan-out publish queue. Runs until the
/// socket errors/closes or the session is cancelled; always cancels on the
/// way out so the write pump unwinds too.
pub async fn run_read_pump(
    session: Arc<Session>,
    mut receiver: SplitStream<WebSocket>,
    publish: mpsc::Sender<BusEnvelope>,
) {
    loop {
        let message = tokio::select! {
            _ = session.cancelled() => break,
            message = receiver.next() => message,
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(user = %session.user_id(), error = %err, "socket read failed");
                break;
            }
            None => break,
        };
        session.touch();
        match message {
            Message::Text(text) => {
                if !handle_client_frame(&session, text.as_bytes(), &publish).await {
                    break;
                }
            }
            Message::Binary(data) => {
                if !handle_client_frame(&session, &data, &publish).await {
                    break;
                }
            }
            Message::Close(_) => break,
            // axum answers pings itself; both directions just prove liveness
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    session.cancel();
}

/// Returns false when the connection should end (protocol violation or the
/// publish queue went away).
async fn handle_client_frame(
    session: &Arc<Session>,
    raw: &[u8],
    publish: &mpsc::Sender<BusEnvelope>,
) -> bool {
    let frame = match serde_json::from_slice::<ClientFrame>(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(user = %session.user_id(), error = %err, "unparseable client frame");
            session.enqueue(ServerFrame::Error {
                kind: ErrorKind::InvalidFrame,
            });
            return false;
        }
    };
    match frame {
        ClientFrame::Chat { content } => {
            let Some(pairing) = session.pairing() else {
                session.enqueue(ServerFrame::Error {
                    kind: ErrorKind::NotPaired,
                });
                return true;
            };
            let envelope = BusEnvelope::chat(
                pairing.room_id,
                session.user_id().to_string(),
                pairing.partner,
                content,
            );
            // Bounded send: overload here backpressures the reader instead
            // of growing an unbounded backlog.
            if publish.send(envelope).await.is_err() {
                warn!(user = %session.user_id(), "publish queue closed; ending session");
                return false;
            }
            true
        }
        ClientFrame::Leave => {
            // Teardown closes the room and notifies the partner; the client
            // just gets confirmation before the connection unwinds.
            session.enqueue(ServerFrame::RoomClosed);
            false
        }
    }
}

/// Drain the outbound queue to the socket and emit keepalive pings so a
/// half-open connection is noticed. Every write is bounded by
/// `write_timeout`; a stalled or failed write cancels the session.
pub async fn run_write_pump(
    session: Arc<Session>,
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerFrame>,
    keepalive: Duration,
    write_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset();
    loop {
        tokio::select! {
            _ = session.cancelled() => {
                let _ = timeout(write_timeout, sender.send(Message::Close(None))).await;
                break;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(user = %session.user_id(), error = %err, "failed to encode frame");
                        continue;
                    }
                };
                match timeout(write_timeout, sender.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(user = %session.user_id(), error = %err, "socket write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(user = %session.user_id(), "socket write timed out");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                match timeout(write_timeout, sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(user = %session.user_id(), "keepalive failed; closing");
                        break;
                    }
                }
            }
        }
    }
    session.cancel();
}

/// Unwinds a session: cancel both pumps, drop registry and queue
/// references, close the room and tell the partner. Safe to call from
/// concurrent triggers; only the first caller does the work.
pub async fn teardown(
    session: &Arc<Session>,
    registry: &ConnectionRegistry,
    matchmaker: &MatchmakerHandle,
    rooms: &Arc<dyn RoomStore>,
    publish: &mpsc::Sender<BusEnvelope>,
) {
    if !session.begin_teardown() {
        return;
    }
    session.cancel();
    registry.unregister(session);
    matchmaker.withdraw(session.conn_id()).await;
    if let Some(pairing) = session.pairing() {
        if let Err(err) = rooms.close(pairing.room_id).await {
            warn!(room = %pairing.room_id, error = %err, "failed to close room");
        }
        let notice = BusEnvelope::room_closed(
            pairing.room_id,
            session.user_id().to_string(),
            pairing.partner.clone(),
        );
        // Best effort: the partner may already be gone, or the pipeline may
        // be shutting down.
        if publish.send(notice).await.is_err() {
            debug!(room = %pairing.room_id, "publish queue closed during teardown");
        }
    }
    info!(user = %session.user_id(), conn = %session.conn_id(), "session torn down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchmaker::Matchmaker;
    use crate::storage::MemoryStore;

    fn test_session(user: &str, depth: usize) -> (Arc<Session>, mpsc::Receiver<ServerFrame>) {
        Session::new(user.to_string(), Criteria::Any, depth)
    }

    #[tokio::test]
    async fn outbound_frames_arrive_in_enqueue_order() {
        let (session, mut rx) = test_session("alice", 8);
        for i in 0..3 {
            assert!(session.enqueue(ServerFrame::Chat {
                from: "bob".into(),
                content: format!("msg-{i}"),
                sent_at: i,
            }));
        }
        for i in 0..3 {
            match rx.recv().await.unwrap() {
                ServerFrame::Chat { content, .. } => assert_eq!(content, format!("msg-{i}")),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn full_queue_drops_the_newest_frame() {
        let (session, mut rx) = test_session("alice", 1);
        assert!(session.enqueue(ServerFrame::Pairing));
        assert!(!session.enqueue(ServerFrame::RoomClosed));
        assert_eq!(rx.recv().await.unwrap(), ServerFrame::Pairing);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pairing_is_set_once() {
        let (session, _rx) = test_session("alice", 4);
        let room = Uuid::new_v4();
        assert!(session.mark_paired(room, "bob".into()));
        assert!(!session.mark_paired(Uuid::new_v4(), "carol".into()));
        let pairing = session.pairing().unwrap();
        assert_eq!(pairing.room_id, room);
        assert_eq!(pairing.partner, "bob");
    }

    #[tokio::test]
    async fn torn_down_session_refuses_pairing() {
        let (session, _rx) = test_session("alice", 4);
        assert!(session.begin_teardown());
        assert!(!session.mark_paired(Uuid::new_v4(), "bob".into()));
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_closes_the_room() {
        let store = Arc::new(MemoryStore::new());
        let rooms: Arc<dyn RoomStore> = store.clone();
        let registry = ConnectionRegistry::new();
        let (handle, matchmaker) = Matchmaker::new(rooms.clone(), 16);
        tokio::spawn(matchmaker.run());
        let (publish_tx, mut publish_rx) = mpsc::channel(16);

        let (session, _rx) = test_session("alice", 4);
        registry.register(session.clone());
        let room = rooms.create("alice", "bob").await.unwrap();
        assert!(session.mark_paired(room.id, "bob".into()));

        teardown(&session, &registry, &handle, &rooms, &publish_tx).await;
        teardown(&session, &registry, &handle, &rooms, &publish_tx).await;

        assert!(session.is_cancelled());
        assert!(registry.find("alice").is_none());
        assert!(store.room(room.id).unwrap().closed);
        // exactly one partner notification despite the double trigger
        let notice = publish_rx.recv().await.unwrap();
        assert_eq!(notice.to, "bob");
        assert!(publish_rx.try_recv().is_err());
    }
}
