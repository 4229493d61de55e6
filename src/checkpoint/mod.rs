//! Checkpoint Store (§4.2, component B): a durable `(thread_id,
//! checkpoint_id) → {workflow_state, parent_checkpoint_id?, created_at}`
//! map backed by SQLite, directly grounded on the teacher's
//! `flow::persistence::SQLiteFlowPersistence` (trait + single-connection
//! impl guarded by a mutex, `CREATE TABLE IF NOT EXISTS` at construction,
//! JSON-serialized state column).
//!
//! `rusqlite` is synchronous; like the teacher's persistence layer this
//! store does not spawn its own blocking pool — callers on the async side
//! (the Workflow Engine) are expected to wrap calls in
//! `tokio::task::spawn_blocking` where they run on a shared runtime, since a
//! single SQLite connection serializes writes regardless.

mod sqlite;

pub use sqlite::SqliteCheckpointStore;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreResult;

/// A workflow's checkpoint thread: the conversation it belongs to crossed
/// with the workflow instance itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    pub conversation_id: Uuid,
    pub workflow_id: Uuid,
}

impl ThreadId {
    pub fn new(conversation_id: Uuid, workflow_id: Uuid) -> Self {
        Self { conversation_id, workflow_id }
    }
}

/// One durable snapshot of a workflow's state.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub checkpoint_id: i64,
    pub parent_checkpoint_id: Option<i64>,
    pub workflow_state: Value,
    pub created_at: DateTime<Utc>,
}

/// Durable checkpoint storage. Writes must be durable before they are
/// acknowledged to the Workflow Engine (§4.2); a write failure is surfaced
/// as `Err` so the engine retries the step rather than advancing visible
/// workflow state on an unconfirmed checkpoint.
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint for `thread`, returning a `checkpoint_id`
    /// monotonic within that thread (§4.2: "monotonic within a thread").
    fn put(&self, thread: ThreadId, workflow_state: Value, parent_checkpoint_id: Option<i64>) -> CoreResult<i64>;

    /// Fetch one checkpoint by id, or the latest committed one for the
    /// thread when `checkpoint_id` is `None`.
    fn get(&self, thread: ThreadId, checkpoint_id: Option<i64>) -> CoreResult<Option<Checkpoint>>;

    /// All checkpoints for a thread, oldest first.
    fn list(&self, thread: ThreadId) -> CoreResult<Vec<Checkpoint>>;

    /// Delete checkpoints older than `older_than`, returning the count
    /// removed. Used by the checkpoint-GC background pipeline (§4.8).
    fn gc(&self, older_than: DateTime<Utc>) -> CoreResult<usize>;
}
