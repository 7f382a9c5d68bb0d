use std::collections::VecDeque;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::ServerFrame;
use crate::session::Session;
use crate::storage::RoomStore;

/// Who a waiting client is willing to be paired with. `any` matches
/// everything; a tag only matches the same tag or an `any` waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criteria {
    Any,
    Tag(String),
}

impl Criteria {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("any") {
            Criteria::Any
        } else {
            Criteria::Tag(trimmed.to_string())
        }
    }

    pub fn compatible(&self, other: &Criteria) -> bool {
        match (self, other) {
            (Criteria::Any, _) | (_, Criteria::Any) => true,
            (Criteria::Tag(a), Criteria::Tag(b)) => a == b,
        }
    }
}

enum Command {
    Enqueue(Arc<Session>),
    Withdraw(Uuid),
}

/// Cloneable handle feeding the matchmaking loop.
#[derive(Clone)]
pub struct MatchmakerHandle {
    tx: mpsc::Sender<Command>,
}

impl MatchmakerHandle {
    /// Hands a waiting session to the matching loop. Returns false only if
    /// the loop is gone (shutdown).
    pub async fn enqueue(&self, session: Arc<Session>) -> bool {
        self.tx.send(Command::Enqueue(session)).await.is_ok()
    }

    /// Removes a disconnected waiter. Once the command is processed the
    /// connection can never be matched again.
    pub async fn withdraw(&self, conn_id: Uuid) {
        let _ = self.tx.send(Command::Withdraw(conn_id)).await;
    }
}

/// Single-owner matching loop. The waiting list lives inside the actor, so
/// matching, removal, and the no-double-match guarantee need no locks: all
/// mutations happen on one task, FIFO over the command channel.
pub struct Matchmaker {
    rx: mpsc::Receiver<Command>,
    rooms: Arc<dyn RoomStore>,
    waiting: VecDeque<Arc<Session>>,
}

impl Matchmaker {
    pub fn new(rooms: Arc<dyn RoomStore>, queue_depth: usize) -> (MatchmakerHandle, Self) {
        let (tx, rx) = mpsc::channel(queue_depth);
        (
            MatchmakerHandle { tx },
            Self {
                rx,
                rooms,
                waiting: VecDeque::new(),
            },
        )
    }

    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Enqueue(session) => self.pair_or_wait(session).await,
                Command::Withdraw(conn_id) => {
                    self.waiting.retain(|waiter| waiter.conn_id() != conn_id);
                }
            }
        }
        debug!("matchmaker loop stopped");
    }

    async fn pair_or_wait(&mut self, arrival: Arc<Session>) {
        if arrival.is_cancelled() || arrival.pairing().is_some() {
            return;
        }
        // Disconnected waiters whose withdraw is still in flight are dead
        // weight; drop them before scanning.
        self.waiting.retain(|waiter| !waiter.is_cancelled());

        let candidate_idx = self.waiting.iter().position(|waiter| {
            waiter.user_id() != arrival.user_id()
                && waiter.criteria().compatible(arrival.criteria())
        });
        let Some(idx) = candidate_idx else {
            self.waiting.push_back(arrival);
            return;
        };
        let candidate = self
            .waiting
            .remove(idx)
            .expect("candidate index from position scan");

        let room = match self
            .rooms
            .create(candidate.user_id(), arrival.user_id())
            .await
        {
            Ok(room) => room,
            Err(err) => {
                error!(error = %err, "room creation failed; both sessions stay queued");
                self.waiting.push_front(candidate);
                self.waiting.push_back(arrival);
                return;
            }
        };

        let candidate_paired = candidate.mark_paired(room.id, arrival.user_id().to_string());
        let arrival_paired = arrival.mark_paired(room.id, candidate.user_id().to_string());
        if !candidate_paired || !arrival_paired {
            // One side began teardown between the scan and here. The room
            // is already persisted, so close it and tell whoever made it in.
            warn!(room = %room.id, "peer torn down mid-match; closing room");
            if let Err(err) = self.rooms.close(room.id).await {
                warn!(room = %room.id, error = %err, "failed to close aborted room");
            }
            for (paired, session) in [(candidate_paired, &candidate), (arrival_paired, &arrival)] {
                if paired {
                    session.enqueue(ServerFrame::RoomClosed);
                }
            }
            return;
        }

        counter!("driftbottle_pairs_matched_total", 1);
        info!(
            room = %room.id,
            user_a = %candidate.user_id(),
            user_b = %arrival.user_id(),
            "matched pair"
        );
        candidate.enqueue(ServerFrame::Paired { room_id: room.id });
        arrival.enqueue(ServerFrame::Paired { room_id: room.id });
    }
}
