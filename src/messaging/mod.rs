//! Messaging & Presence Core (§4.9, component I): a durable per-room
//! message log with at-rest encryption, unread tracking, and presence
//! heartbeats. Independent of the workflow/agent subsystem; its storage
//! template is the Checkpoint Store's SQLite layer (component B), since
//! `spec.md`'s persisted-state layout calls out messaging explicitly as
//! durable, unlike the in-process-only Shared Memory Store (component A).

mod encryption;
mod store;
mod types;

pub use encryption::EncryptionService;
pub use store::MessagingStore;
pub use types::{
    ChatMessage, MessageType, NotificationSettings, Presence, PresenceStatus, Reaction, Room,
    RoomParticipant, RoomType, MESSAGE_MAX_LENGTH,
};

use crate::config::CoreConfig;
use crate::error::CoreResult;

/// Builds the messaging store from process configuration: the SQLite file
/// at `config.messaging_db_path` and the at-rest encryption layer keyed by
/// `config.message_encryption_master_key`.
pub fn build_store(config: &CoreConfig) -> CoreResult<MessagingStore> {
    let encryption = EncryptionService::new(
        config.message_encryption_master_key.as_deref(),
        config.message_encryption_enabled,
    )?;
    MessagingStore::open(&config.messaging_db_path, encryption)
}
