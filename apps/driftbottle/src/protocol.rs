use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolved identity of a connected user. Token verification happens
/// upstream of this service; by the time a connection reaches the core the
/// identity is just an opaque string.
pub type UserId = String;

/// Frames a client may send after the connection is established.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Chat payload for the current partner.
    Chat { content: String },
    /// Explicitly end the current room.
    Leave,
}

/// Frames the server pushes to a client: state notifications plus relayed
/// chat. The `type` discriminator is what clients branch on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Queued, waiting for a compatible partner.
    Pairing,
    /// A partner was found just now.
    Paired { room_id: Uuid },
    /// Reconnected into an existing open room.
    InRoom { room_id: Uuid },
    /// The pairing ended (partner left or disconnected).
    RoomClosed,
    Chat {
        from: UserId,
        content: String,
        sent_at: i64,
    },
    Error { kind: ErrorKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingIdentity,
    MissingCriteria,
    NotPaired,
    InvalidFrame,
    LookupFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Chat,
    RoomClosed,
}

/// The message shape carried over the broker topic. Every instance
/// publishes these unconditionally and every instance receives all of
/// them; routing happens at the subscriber by recipient lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub kind: EnvelopeKind,
    pub room_id: Uuid,
    pub from: UserId,
    pub to: UserId,
    #[serde(default)]
    pub content: String,
    pub sent_at: i64,
}

impl BusEnvelope {
    pub fn chat(room_id: Uuid, from: UserId, to: UserId, content: String) -> Self {
        Self {
            kind: EnvelopeKind::Chat,
            room_id,
            from,
            to,
            content,
            sent_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn room_closed(room_id: Uuid, from: UserId, to: UserId) -> Self {
        Self {
            kind: EnvelopeKind::RoomClosed,
            room_id,
            from,
            to,
            content: String::new(),
            sent_at: Utc::now().timestamp_millis(),
        }
    }

    /// The client-facing frame this envelope turns into on delivery.
    pub fn to_frame(&self) -> ServerFrame {
        match self.kind {
            EnvelopeKind::Chat => ServerFrame::Chat {
                from: self.from.clone(),
                content: self.content.clone(),
                sent_at: self.sent_at,
            },
            EnvelopeKind::RoomClosed => ServerFrame::RoomClosed,
        }
    }
}
