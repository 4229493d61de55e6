//! Shared-memory data types: conversations, messages and the handful of
//! recognised shared-memory keys (`spec.md` §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Human,
    Ai,
    System,
    Tool,
}

/// An append-only conversation entry. Deletions tombstone rather than remove
/// (I5) so ordering and indices never shift under a concurrent reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub tombstoned: bool,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            metadata: None,
            tombstoned: false,
        }
    }
}

/// Snapshot of the editor at request time. Treated as immutable for the
/// duration of one workflow step (I7) — callers read it once at step start
/// and never re-fetch mid-step even if the underlying document changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveEditorSnapshot {
    pub document_id: Uuid,
    pub filename: String,
    pub canonical_path: String,
    #[serde(default)]
    pub frontmatter: HashMap<String, serde_json::Value>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<Uuid>,
}

/// An entry of `referenced_context`: category → list of referenced documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferencedDocument {
    pub document_id: Uuid,
    pub filename: String,
    pub content: String,
}

/// Shared-memory keys that merge by appending to the existing list instead
/// of replacing it outright (§4.1).
pub const APPEND_SEMANTICS_KEYS: &[&str] = &["search_history", "tools_used", "messages"];

pub const KEY_ACTIVE_EDITOR: &str = "active_editor";
pub const KEY_REFERENCED_CONTEXT: &str = "referenced_context";
pub const KEY_SEARCH_HISTORY: &str = "search_history";
pub const KEY_SEARCH_RESULTS: &str = "search_results";
pub const KEY_CONFIDENCE_LEVEL: &str = "confidence_level";
