use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use drift_bus::{Bus, BusError, BusMessage, BusResult};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

type TopicSenders = Arc<parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>;

/// `Bus` over Redis pub/sub. Outgoing messages queue into a bounded
/// channel drained by a writer task; a reader task holds the pub/sub
/// connection, resubscribing with backoff whenever the stream drops, and
/// fans received messages into per-topic broadcast channels. Topics must be
/// named at connect time — Redis needs the subscriptions up before
/// messages flow.
pub struct RedisBus {
    outgoing: mpsc::Sender<BusMessage>,
    topics: TopicSenders,
    depth: usize,
}

impl RedisBus {
    pub async fn connect(
        redis_url: &str,
        topics: &[&str],
        outgoing_depth: usize,
        topic_depth: usize,
    ) -> BusResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| BusError::Transport(err.to_string()))?;
        let publish_conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;

        let senders: TopicSenders = Arc::new(parking_lot::RwLock::new(
            topics
                .iter()
                .map(|topic| (topic.to_string(), broadcast::channel(topic_depth).0))
                .collect(),
        ));

        let (outgoing_tx, outgoing_rx) = mpsc::channel(outgoing_depth);
        tokio::spawn(run_writer(publish_conn, outgoing_rx));
        tokio::spawn(run_reader(
            client,
            topics.iter().map(|topic| topic.to_string()).collect(),
            senders.clone(),
        ));

        Ok(Self {
            outgoing: outgoing_tx,
            topics: senders,
            depth: topic_depth,
        })
    }
}

impl Bus for RedisBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.depth).0)
            .subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        self.outgoing
            .try_send(BusMessage::new(topic, payload))
            .map_err(|err| match err {
                TrySendError::Full(_) => BusError::Backlog,
                TrySendError::Closed(_) => BusError::Closed,
            })
    }
}

async fn run_writer(mut conn: ConnectionManager, mut rx: mpsc::Receiver<BusMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(err) = conn
            .publish::<_, _, ()>(&message.topic, message.payload.as_ref())
            .await
        {
            // dropped for this message only; the ConnectionManager
            // re-establishes the connection underneath us
            warn!(topic = %message.topic, error = %err, "redis publish failed");
        }
    }
    debug!("redis bus writer stopped");
}

async fn run_reader(client: redis::Client, topics: Vec<String>, senders: TopicSenders) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                let mut subscribed = true;
                for topic in &topics {
                    if let Err(err) = pubsub.subscribe(topic).await {
                        warn!(topic = %topic, error = %err, "redis subscribe failed");
                        subscribed = false;
                        break;
                    }
                }
                if subscribed {
                    info!(topics = ?topics, "redis bus subscribed");
                    let mut stream = pubsub.on_message();
                    while let Some(message) = stream.next().await {
                        let topic = message.get_channel_name().to_string();
                        let payload: Vec<u8> = match message.get_payload() {
                            Ok(payload) => payload,
                            Err(err) => {
                                warn!(topic = %topic, error = %err, "bad redis payload");
                                continue;
                            }
                        };
                        let sender = senders.read().get(&topic).cloned();
                        if let Some(sender) = sender {
                            let _ = sender.send(BusMessage::new(topic, Bytes::from(payload)));
                        }
                    }
                    warn!("redis pub/sub stream ended; reconnecting");
                }
            }
            Err(err) => {
                warn!(error = %err, "redis pub/sub connection failed; retrying");
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
