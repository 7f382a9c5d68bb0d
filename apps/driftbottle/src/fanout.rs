use std::sync::Arc;

use bytes::Bytes;
use drift_bus::Bus;
use metrics::counter;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::protocol::{BusEnvelope, EnvelopeKind};
use crate::registry::ConnectionRegistry;
use crate::storage::{MessageArchive, MessageRecord};

/// The one broker topic every instance publishes to and subscribes from.
pub const CHAT_TOPIC: &str = "driftbottle:messages";

/// Spawns both fan-out pumps and returns the local publish queue plus the
/// pump task handles. Every instance runs exactly one of each. The broker
/// subscription is taken before this returns, so nothing published
/// afterwards can slip past the subscribe pump.
pub fn spawn(
    bus: Arc<dyn Bus>,
    registry: ConnectionRegistry,
    archive: Arc<dyn MessageArchive>,
    publish_depth: usize,
) -> (mpsc::Sender<BusEnvelope>, JoinHandle<()>, JoinHandle<()>) {
    let (publish_tx, publish_rx) = mpsc::channel(publish_depth);
    let subscription = bus.subscribe(CHAT_TOPIC);
    let publisher = PublishPump {
        rx: publish_rx,
        bus,
        archive,
    };
    let subscriber = SubscribePump { registry };
    let publish_task = tokio::spawn(publisher.run());
    let subscribe_task = tokio::spawn(subscriber.run(subscription));
    (publish_tx, publish_task, subscribe_task)
}

/// Forwards every locally produced envelope to the broker, unmodified and
/// unconditionally — the recipient may be on any instance, so there is no
/// locality filter here. Chat envelopes are archived from this side of the
/// pipeline: once per cluster, whether or not the recipient is reachable.
struct PublishPump {
    rx: mpsc::Receiver<BusEnvelope>,
    bus: Arc<dyn Bus>,
    archive: Arc<dyn MessageArchive>,
}

impl PublishPump {
    async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            let payload = match serde_json::to_vec(&envelope) {
                Ok(payload) => Bytes::from(payload),
                Err(err) => {
                    warn!(error = %err, "failed to encode envelope; dropping");
                    continue;
                }
            };
            match self.bus.publish(CHAT_TOPIC, payload) {
                Ok(()) => {
                    counter!("driftbottle_messages_published_total", 1);
                }
                Err(err) => {
                    // transient broker trouble drops this message, not the
                    // session that sent it
                    warn!(error = %err, "broker publish failed; dropping message");
                    counter!("driftbottle_publish_failed_total", 1);
                }
            }
            if envelope.kind == EnvelopeKind::Chat {
                let record = MessageRecord {
                    room_id: envelope.room_id,
                    from: envelope.from,
                    to: envelope.to,
                    content: envelope.content,
                    sent_at: envelope.sent_at,
                };
                if let Err(err) = self.archive.append(record).await {
                    warn!(error = %err, "archive append failed");
                    counter!("driftbottle_archive_failed_total", 1);
                }
            }
        }
        debug!("publish pump stopped");
    }
}

/// Receives every envelope published by any instance (this one included)
/// and delivers the ones whose recipient is registered locally. A registry
/// miss is the normal cross-instance case and is discarded without comment.
struct SubscribePump {
    registry: ConnectionRegistry,
}

impl SubscribePump {
    async fn run(self, mut sub: tokio::sync::broadcast::Receiver<drift_bus::BusMessage>) {
        loop {
            match sub.recv().await {
                Ok(message) => self.deliver(&message.payload),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscribe pump lagged behind the broker");
                    counter!("driftbottle_subscribe_lagged_total", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("subscribe pump stopped");
    }

    fn deliver(&self, payload: &[u8]) {
        let envelope = match serde_json::from_slice::<BusEnvelope>(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "undecodable envelope from broker; dropping");
                return;
            }
        };
        let Some(session) = self.registry.find(&envelope.to) else {
            trace!(recipient = %envelope.to, "recipient not on this instance");
            return;
        };
        // The broker is at-least-once and unordered across publishers; a
        // room-closed notice for a pairing this session no longer holds is
        // a stale duplicate.
        if envelope.kind == EnvelopeKind::RoomClosed {
            let current = session.pairing().map(|pairing| pairing.room_id);
            if current != Some(envelope.room_id) {
                trace!(room = %envelope.room_id, "stale room-closed notice; dropping");
                return;
            }
        }
        if session.enqueue(envelope.to_frame()) {
            counter!("driftbottle_messages_delivered_total", 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchmaker::{Criteria, Matchmaker, MatchmakerHandle};
    use crate::protocol::ServerFrame;
    use crate::session::{teardown, Session};
    use crate::storage::{MemoryStore, RoomStore};
    use drift_bus::LocalBus;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::{sleep, timeout, Duration};
    use uuid::Uuid;

    /// One simulated server instance: its own registry, matchmaker, store
    /// handles, and fan-out pumps. Sharing a `LocalBus` between two of
    /// these is the broker connecting two instances.
    struct Instance {
        registry: ConnectionRegistry,
        matchmaker: MatchmakerHandle,
        rooms: Arc<dyn RoomStore>,
        publish: mpsc::Sender<BusEnvelope>,
    }

    impl Instance {
        fn start(bus: &Arc<LocalBus>, store: &Arc<MemoryStore>) -> Self {
            let registry = ConnectionRegistry::new();
            let rooms: Arc<dyn RoomStore> = store.clone();
            let archive: Arc<dyn MessageArchive> = store.clone();
            let (matchmaker, worker) = Matchmaker::new(rooms.clone(), 64);
            tokio::spawn(worker.run());
            let shared: Arc<dyn Bus> = bus.clone();
            let (publish, _pub_task, _sub_task) =
                spawn(shared, registry.clone(), archive, 64);
            Self {
                registry,
                matchmaker,
                rooms,
                publish,
            }
        }

        fn connect(&self, user: &str) -> (Arc<Session>, Receiver<ServerFrame>) {
            let (session, rx) = Session::new(user.to_string(), Criteria::Any, 16);
            self.registry.register(session.clone());
            (session, rx)
        }
    }

    async fn recv_frame(rx: &mut Receiver<ServerFrame>) -> ServerFrame {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn chat_crosses_instances_and_misses_are_silent() {
        let bus = Arc::new(LocalBus::new());
        let store = Arc::new(MemoryStore::new());
        let instance_one = Instance::start(&bus, &store);
        let instance_two = Instance::start(&bus, &store);

        let (alice, _alice_rx) = instance_one.connect("alice");
        let (bob, mut bob_rx) = instance_two.connect("bob");
        let room = instance_one.rooms.create("alice", "bob").await.unwrap();
        alice.mark_paired(room.id, "bob".into());
        bob.mark_paired(room.id, "alice".into());

        // alice (instance one) sends; instance one's own subscriber finds
        // no local "bob" and discards; instance two delivers
        instance_one
            .publish
            .send(BusEnvelope::chat(
                room.id,
                "alice".into(),
                "bob".into(),
                "message in a bottle".into(),
            ))
            .await
            .unwrap();

        match recv_frame(&mut bob_rx).await {
            ServerFrame::Chat { from, content, .. } => {
                assert_eq!(from, "alice");
                assert_eq!(content, "message in a bottle");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        // archived exactly once even though both instances saw the broadcast
        sleep(Duration::from_millis(20)).await;
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.messages()[0].content, "message in a bottle");
    }

    #[tokio::test]
    async fn delivery_preserves_sender_order_per_session() {
        let bus = Arc::new(LocalBus::new());
        let store = Arc::new(MemoryStore::new());
        let instance = Instance::start(&bus, &store);
        let (bob, mut bob_rx) = instance.connect("bob");
        let room_id = Uuid::new_v4();
        bob.mark_paired(room_id, "alice".into());

        for i in 0..5 {
            instance
                .publish
                .send(BusEnvelope::chat(
                    room_id,
                    "alice".into(),
                    "bob".into(),
                    format!("msg-{i}"),
                ))
                .await
                .unwrap();
        }
        for i in 0..5 {
            match recv_frame(&mut bob_rx).await {
                ServerFrame::Chat { content, .. } => assert_eq!(content, format!("msg-{i}")),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn disconnect_closes_room_and_notifies_partner_across_instances() {
        let bus = Arc::new(LocalBus::new());
        let store = Arc::new(MemoryStore::new());
        let instance_one = Instance::start(&bus, &store);
        let instance_two = Instance::start(&bus, &store);

        let (alice, _alice_rx) = instance_one.connect("alice");
        let (bob, mut bob_rx) = instance_two.connect("bob");
        let room = instance_one.rooms.create("alice", "bob").await.unwrap();
        alice.mark_paired(room.id, "bob".into());
        bob.mark_paired(room.id, "alice".into());

        teardown(
            &alice,
            &instance_one.registry,
            &instance_one.matchmaker,
            &instance_one.rooms,
            &instance_one.publish,
        )
        .await;

        assert_eq!(recv_frame(&mut bob_rx).await, ServerFrame::RoomClosed);
        assert!(store.room(room.id).unwrap().closed);
        assert!(instance_one.registry.find("alice").is_none());
    }

    #[tokio::test]
    async fn stale_room_closed_notice_is_dropped() {
        let bus = Arc::new(LocalBus::new());
        let store = Arc::new(MemoryStore::new());
        let instance = Instance::start(&bus, &store);
        let (bob, mut bob_rx) = instance.connect("bob");
        bob.mark_paired(Uuid::new_v4(), "carol".into());

        // notice for a room bob is not in — a duplicate from an old pairing
        instance
            .publish
            .send(BusEnvelope::room_closed(
                Uuid::new_v4(),
                "alice".into(),
                "bob".into(),
            ))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn end_to_end_pairing_then_chat() {
        let bus = Arc::new(LocalBus::new());
        let store = Arc::new(MemoryStore::new());
        let instance = Instance::start(&bus, &store);

        let (alice, mut alice_rx) = instance.connect("alice");
        let (bob, mut bob_rx) = instance.connect("bob");
        instance.matchmaker.enqueue(alice.clone()).await;
        instance.matchmaker.enqueue(bob.clone()).await;

        let room_id = match recv_frame(&mut alice_rx).await {
            ServerFrame::Paired { room_id } => room_id,
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(
            recv_frame(&mut bob_rx).await,
            ServerFrame::Paired { room_id }
        );

        let pairing = alice.pairing().unwrap();
        instance
            .publish
            .send(BusEnvelope::chat(
                pairing.room_id,
                "alice".into(),
                pairing.partner,
                "hello".into(),
            ))
            .await
            .unwrap();
        match recv_frame(&mut bob_rx).await {
            ServerFrame::Chat { from, content, .. } => {
                assert_eq!(from, "alice");
                assert_eq!(content, "hello");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
