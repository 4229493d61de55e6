//! Checkpoint GC (§4.8): every interval, remove checkpoints older than the
//! retention window. Thin driver over `CheckpointStore::gc`, which already
//! owns the actual deletion (component B).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::checkpoint::CheckpointStore;
use crate::error::CoreResult;

pub struct CheckpointGc {
    store: Arc<dyn CheckpointStore>,
    retention: chrono::Duration,
}

impl CheckpointGc {
    pub fn new(store: Arc<dyn CheckpointStore>, retention: Duration) -> Self {
        Self { store, retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero()) }
    }

    /// One GC pass; returns the number of checkpoints removed.
    pub async fn run_round(&self) -> CoreResult<usize> {
        let store = self.store.clone();
        let cutoff = Utc::now() - self.retention;
        tokio::task::spawn_blocking(move || store.gc(cutoff)).await.map_err(|e| crate::error::CoreError::Transient(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{SqliteCheckpointStore, ThreadId};
    use uuid::Uuid;

    #[tokio::test]
    async fn removes_checkpoints_older_than_retention() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let thread = ThreadId::new(Uuid::new_v4(), Uuid::new_v4());
        store.put(thread, serde_json::json!({"status": "running"}), None).unwrap();

        let gc = CheckpointGc::new(store.clone(), Duration::from_secs(0));
        // Everything committed before "now" is eligible once retention is zero.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let removed = gc.run_round().await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.list(thread).unwrap().is_empty());
    }
}
