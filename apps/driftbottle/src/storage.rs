use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::UserId;

/// Persisted pairing record. Rooms are never deleted; a finished pairing is
/// flipped to `closed` so later lookups can tell "ended" apart from "never
/// existed".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub user_a: UserId,
    pub user_b: UserId,
    pub closed: bool,
}

impl Room {
    pub fn partner_of(&self, user_id: &str) -> Option<&str> {
        if self.user_a == user_id {
            Some(&self.user_b)
        } else if self.user_b == user_id {
            Some(&self.user_a)
        } else {
            None
        }
    }
}

/// Outcome of a by-user room lookup. A closed room is a distinguished
/// result, not an error: callers surface it to the client as a state
/// notification and then treat the user as unpaired.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomLookup {
    Found(Room),
    NotFound,
    Closed(Room),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("room {0} not found")]
    UnknownRoom(Uuid),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn create(&self, user_a: &str, user_b: &str) -> Result<Room, StoreError>;
    async fn close(&self, room_id: Uuid) -> Result<(), StoreError>;
    async fn find_by_user(&self, user_id: &str) -> Result<RoomLookup, StoreError>;
}

/// One archived chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub room_id: Uuid,
    pub from: UserId,
    pub to: UserId,
    pub content: String,
    pub sent_at: i64,
}

#[async_trait]
pub trait MessageArchive: Send + Sync {
    async fn append(&self, record: MessageRecord) -> Result<(), StoreError>;
}

/// Redis-backed store. Rooms live at `room:{id}` as JSON, with a
/// `room:user:{uid}` index pointing each participant at their latest room;
/// the index is overwritten on re-pair, so it always resolves to the most
/// recent pairing. Messages append to `room:{id}:messages`.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    async fn load_room(conn: &mut ConnectionManager, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        let value: Option<String> = conn.get(room_key(room_id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RoomStore for RedisStore {
    async fn create(&self, user_a: &str, user_b: &str) -> Result<Room, StoreError> {
        let room = Room {
            id: Uuid::new_v4(),
            user_a: user_a.to_string(),
            user_b: user_b.to_string(),
            closed: false,
        };
        let value = serde_json::to_string(&room)?;
        let mut conn = self.redis.clone();
        redis::pipe()
            .cmd("SET")
            .arg(room_key(room.id))
            .arg(&value)
            .ignore()
            .cmd("SET")
            .arg(user_key(user_a))
            .arg(room.id.to_string())
            .ignore()
            .cmd("SET")
            .arg(user_key(user_b))
            .arg(room.id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(room)
    }

    async fn close(&self, room_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let mut room = Self::load_room(&mut conn, room_id)
            .await?
            .ok_or(StoreError::UnknownRoom(room_id))?;
        if room.closed {
            return Ok(());
        }
        room.closed = true;
        let value = serde_json::to_string(&room)?;
        conn.set::<_, _, ()>(room_key(room_id), value).await?;
        Ok(())
    }

    async fn find_by_user(&self, user_id: &str) -> Result<RoomLookup, StoreError> {
        let mut conn = self.redis.clone();
        let pointer: Option<String> = conn.get(user_key(user_id)).await?;
        let Some(pointer) = pointer else {
            return Ok(RoomLookup::NotFound);
        };
        let room_id = Uuid::parse_str(&pointer)
            .map_err(|err| StoreError::Backend(format!("bad room index for {user_id}: {err}")))?;
        match Self::load_room(&mut conn, room_id).await? {
            Some(room) if room.closed => Ok(RoomLookup::Closed(room)),
            Some(room) => Ok(RoomLookup::Found(room)),
            None => Ok(RoomLookup::NotFound),
        }
    }
}

#[async_trait]
impl MessageArchive for RedisStore {
    async fn append(&self, record: MessageRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(&record)?;
        conn.rpush::<_, _, ()>(messages_key(record.room_id), value)
            .await?;
        Ok(())
    }
}

fn room_key(room_id: Uuid) -> String {
    format!("room:{room_id}")
}

fn user_key(user_id: &str) -> String {
    format!("room:user:{user_id}")
}

fn messages_key(room_id: Uuid) -> String {
    format!("room:{room_id}:messages")
}

/// In-memory store for tests and single-instance development. Same
/// semantics as `RedisStore`: the per-user index tracks the latest room and
/// closed rooms stay around.
#[derive(Default)]
pub struct MemoryStore {
    rooms: parking_lot::Mutex<std::collections::HashMap<Uuid, Room>>,
    by_user: parking_lot::Mutex<std::collections::HashMap<UserId, Uuid>>,
    messages: parking_lot::Mutex<Vec<MessageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self, room_id: Uuid) -> Option<Room> {
        self.rooms.lock().get(&room_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn create(&self, user_a: &str, user_b: &str) -> Result<Room, StoreError> {
        let room = Room {
            id: Uuid::new_v4(),
            user_a: user_a.to_string(),
            user_b: user_b.to_string(),
            closed: false,
        };
        self.rooms.lock().insert(room.id, room.clone());
        let mut by_user = self.by_user.lock();
        by_user.insert(room.user_a.clone(), room.id);
        by_user.insert(room.user_b.clone(), room.id);
        Ok(room)
    }

    async fn close(&self, room_id: Uuid) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock();
        let room = rooms.get_mut(&room_id).ok_or(StoreError::UnknownRoom(room_id))?;
        room.closed = true;
        Ok(())
    }

    async fn find_by_user(&self, user_id: &str) -> Result<RoomLookup, StoreError> {
        let pointer = self.by_user.lock().get(user_id).copied();
        let Some(room_id) = pointer else {
            return Ok(RoomLookup::NotFound);
        };
        match self.rooms.lock().get(&room_id) {
            Some(room) if room.closed => Ok(RoomLookup::Closed(room.clone())),
            Some(room) => Ok(RoomLookup::Found(room.clone())),
            None => Ok(RoomLookup::NotFound),
        }
    }
}

#[async_trait]
impl MessageArchive for MemoryStore {
    async fn append(&self, record: MessageRecord) -> Result<(), StoreError> {
        self.messages.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_distinguishes_open_closed_and_missing() {
        let store = MemoryStore::new();
        assert_eq!(store.find_by_user("alice").await.unwrap(), RoomLookup::NotFound);

        let room = store.create("alice", "bob").await.unwrap();
        match store.find_by_user("alice").await.unwrap() {
            RoomLookup::Found(found) => assert_eq!(found.id, room.id),
            other => panic!("expected Found, got {other:?}"),
        }

        store.close(room.id).await.unwrap();
        match store.find_by_user("bob").await.unwrap() {
            RoomLookup::Closed(found) => {
                assert_eq!(found.id, room.id);
                assert!(found.closed);
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repairing_supersedes_the_user_index() {
        let store = MemoryStore::new();
        let first = store.create("alice", "bob").await.unwrap();
        store.close(first.id).await.unwrap();

        let second = store.create("alice", "carol").await.unwrap();
        match store.find_by_user("alice").await.unwrap() {
            RoomLookup::Found(found) => assert_eq!(found.id, second.id),
            other => panic!("expected Found, got {other:?}"),
        }
        // bob still points at the closed room
        assert_eq!(
            store.find_by_user("bob").await.unwrap(),
            RoomLookup::Closed(store.room(first.id).unwrap())
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let store = MemoryStore::new();
        let room = store.create("alice", "bob").await.unwrap();
        store.close(room.id).await.unwrap();
        store.close(room.id).await.unwrap();
        assert!(store.room(room.id).unwrap().closed);
    }

    #[tokio::test]
    async fn close_unknown_room_is_an_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.close(Uuid::new_v4()).await,
            Err(StoreError::UnknownRoom(_))
        ));
    }

    #[test]
    fn partner_of_picks_the_other_side() {
        let room = Room {
            id: Uuid::new_v4(),
            user_a: "alice".into(),
            user_b: "bob".into(),
            closed: false,
        };
        assert_eq!(room.partner_of("alice"), Some("bob"));
        assert_eq!(room.partner_of("bob"), Some("alice"));
        assert_eq!(room.partner_of("carol"), None);
    }
}
