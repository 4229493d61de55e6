use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

use super::{Checkpoint, CheckpointStore, ThreadId};

/// SQLite-backed implementation of [`CheckpointStore`]. One connection,
/// guarded by a mutex, exactly like `SQLiteFlowPersistence` — a single
/// writer serializes checkpoint writes within one workflow, which is also
/// what §4.2 requires ("a partially-written step never observes a
/// checkpoint from an in-flight sibling step").
#[derive(Debug)]
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open(db_path: &str) -> CoreResult<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CoreError::Transient(format!("creating checkpoint db dir: {e}")))?;
            }
        }
        let conn = Connection::open(db_path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_db()?;
        Ok(store)
    }

    /// An ephemeral store backed by an in-memory SQLite connection, for
    /// tests and for single-process deployments with no durability needs.
    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> CoreResult<()> {
        let conn = self.conn.lock().expect("checkpoint db lock poisoned");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                checkpoint_id INTEGER NOT NULL,
                parent_checkpoint_id INTEGER,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(conversation_id, workflow_id, checkpoint_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_thread
             ON checkpoints(conversation_id, workflow_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_created_at
             ON checkpoints(created_at)",
            [],
        )?;
        Ok(())
    }

    fn row_to_checkpoint(checkpoint_id: i64, parent_checkpoint_id: Option<i64>, state_json: String, created_at: String) -> CoreResult<Checkpoint> {
        let workflow_state: Value = serde_json::from_str(&state_json)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap());
        Ok(Checkpoint { checkpoint_id, parent_checkpoint_id, workflow_state, created_at })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn put(&self, thread: ThreadId, workflow_state: Value, parent_checkpoint_id: Option<i64>) -> CoreResult<i64> {
        let conn = self.conn.lock().expect("checkpoint db lock poisoned");
        let conversation_id = thread.conversation_id.to_string();
        let workflow_id = thread.workflow_id.to_string();

        let next_checkpoint_id: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(checkpoint_id), 0) + 1 FROM checkpoints
                 WHERE conversation_id = ?1 AND workflow_id = ?2",
                params![conversation_id, workflow_id],
                |row| row.get(0),
            )
            .unwrap_or(1);

        let state_json = serde_json::to_string(&workflow_state)?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO checkpoints
             (conversation_id, workflow_id, checkpoint_id, parent_checkpoint_id, state_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![conversation_id, workflow_id, next_checkpoint_id, parent_checkpoint_id, state_json, now],
        )?;

        log::debug!(
            "checkpoint stored: conversation_id={} workflow_id={} checkpoint_id={}",
            conversation_id, workflow_id, next_checkpoint_id
        );

        Ok(next_checkpoint_id)
    }

    fn get(&self, thread: ThreadId, checkpoint_id: Option<i64>) -> CoreResult<Option<Checkpoint>> {
        let conn = self.conn.lock().expect("checkpoint db lock poisoned");
        let conversation_id = thread.conversation_id.to_string();
        let workflow_id = thread.workflow_id.to_string();

        let row: Option<(i64, Option<i64>, String, String)> = match checkpoint_id {
            Some(id) => conn
                .query_row(
                    "SELECT checkpoint_id, parent_checkpoint_id, state_json, created_at
                     FROM checkpoints
                     WHERE conversation_id = ?1 AND workflow_id = ?2 AND checkpoint_id = ?3",
                    params![conversation_id, workflow_id, id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .ok(),
            None => conn
                .query_row(
                    "SELECT checkpoint_id, parent_checkpoint_id, state_json, created_at
                     FROM checkpoints
                     WHERE conversation_id = ?1 AND workflow_id = ?2
                     ORDER BY checkpoint_id DESC LIMIT 1",
                    params![conversation_id, workflow_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .ok(),
        };

        row.map(|(id, parent, state_json, created_at)| {
            Self::row_to_checkpoint(id, parent, state_json, created_at)
        })
        .transpose()
    }

    fn list(&self, thread: ThreadId) -> CoreResult<Vec<Checkpoint>> {
        let conn = self.conn.lock().expect("checkpoint db lock poisoned");
        let conversation_id = thread.conversation_id.to_string();
        let workflow_id = thread.workflow_id.to_string();

        let mut stmt = conn.prepare(
            "SELECT checkpoint_id, parent_checkpoint_id, state_json, created_at
             FROM checkpoints
             WHERE conversation_id = ?1 AND workflow_id = ?2
             ORDER BY checkpoint_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id, workflow_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let (id, parent, state_json, created_at) = row?;
            checkpoints.push(Self::row_to_checkpoint(id, parent, state_json, created_at)?);
        }
        Ok(checkpoints)
    }

    fn gc(&self, older_than: DateTime<Utc>) -> CoreResult<usize> {
        let conn = self.conn.lock().expect("checkpoint db lock poisoned");
        let cutoff = older_than.to_rfc3339();
        let removed = conn.execute("DELETE FROM checkpoints WHERE created_at < ?1", params![cutoff])?;
        if removed > 0 {
            log::info!("checkpoint gc removed {} rows older than {}", removed, cutoff);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn thread() -> ThreadId {
        ThreadId::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn checkpoint_ids_are_monotonic_within_a_thread() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("cp.db").to_str().unwrap()).unwrap();
        let thread = thread();

        let id1 = store.put(thread, json!({"step": 1}), None).unwrap();
        let id2 = store.put(thread, json!({"step": 2}), Some(id1)).unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
    }

    #[test]
    fn get_without_id_returns_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("cp.db").to_str().unwrap()).unwrap();
        let thread = thread();

        store.put(thread, json!({"step": 1}), None).unwrap();
        store.put(thread, json!({"step": 2}), None).unwrap();

        let latest = store.get(thread, None).unwrap().unwrap();
        assert_eq!(latest.workflow_state, json!({"step": 2}));
    }

    #[test]
    fn different_threads_do_not_share_checkpoint_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("cp.db").to_str().unwrap()).unwrap();

        let id_a = store.put(thread(), json!({"a": true}), None).unwrap();
        let id_b = store.put(thread(), json!({"b": true}), None).unwrap();
        assert_eq!(id_a, 1);
        assert_eq!(id_b, 1);
    }

    #[test]
    fn list_is_ordered_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("cp.db").to_str().unwrap()).unwrap();
        let thread = thread();

        store.put(thread, json!({"step": 1}), None).unwrap();
        store.put(thread, json!({"step": 2}), None).unwrap();

        let all = store.list(thread).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].checkpoint_id, 1);
        assert_eq!(all[1].checkpoint_id, 2);
    }

    #[test]
    fn gc_removes_only_old_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("cp.db").to_str().unwrap()).unwrap();
        let thread = thread();
        store.put(thread, json!({"step": 1}), None).unwrap();

        let removed = store.gc(Utc::now() - chrono::Duration::hours(1)).unwrap();
        assert_eq!(removed, 0);

        let removed = store.gc(Utc::now() + chrono::Duration::hours(1)).unwrap();
        assert_eq!(removed, 1);
    }
}
