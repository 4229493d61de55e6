//! Wire-level types for the Messaging & Presence Core (§4.9, component I).
//! Distinct from [`crate::memory::types::Message`], which models an
//! in-conversation agent transcript entry, not a persisted chat message
//! between users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    AiShare,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub muted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub room_id: Uuid,
    pub room_type: RoomType,
    pub room_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomParticipant {
    pub user_id: Uuid,
    pub last_read_at: Option<DateTime<Utc>>,
    pub notification_settings: NotificationSettings,
}

/// A persisted chat message. `content` is always the plaintext; the store
/// handles encryption at rest and never returns ciphertext through this
/// type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    /// Soft-delete marker (I5-style tombstone, mirroring the Shared Memory
    /// Store's append-only log rather than a physical row delete).
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub reaction_id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_seen_at: DateTime<Utc>,
    pub status_message: Option<String>,
}

/// Message bodies longer than this are truncated before storage, matching
/// the original's `MESSAGE_MAX_LENGTH` guard.
pub const MESSAGE_MAX_LENGTH: usize = 10_000;
