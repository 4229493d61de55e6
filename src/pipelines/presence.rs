//! Presence reaper (§4.8): every interval, mark any user whose
//! `last_seen_at` has fallen behind the offline threshold as offline.
//! Persistence lives in the Messaging & Presence Core (component I); this
//! pipeline only drives the periodic sweep against that store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreResult;

use super::scheduler::{run_round, BatchSummary};

/// Presence seam the reaper drives; implemented by the messaging store.
#[async_trait]
pub trait PresenceRepository: Send + Sync {
    async fn users_last_seen_before(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Uuid>>;
    async fn mark_offline(&self, user_id: Uuid) -> CoreResult<()>;
}

pub struct PresenceReaper {
    repository: Arc<dyn PresenceRepository>,
    offline_threshold: Duration,
    concurrency_cap: usize,
}

impl PresenceReaper {
    pub fn new(repository: Arc<dyn PresenceRepository>, offline_threshold: Duration, concurrency_cap: usize) -> Self {
        Self { repository, offline_threshold, concurrency_cap }
    }

    /// One sweep: reap every user whose presence has gone stale relative to
    /// `now`. `now` is caller-supplied so callers can drive this
    /// deterministically in tests.
    pub async fn run_round(&self, now: DateTime<Utc>) -> CoreResult<BatchSummary> {
        let cutoff = now - chrono::Duration::from_std(self.offline_threshold).unwrap_or(chrono::Duration::zero());
        let stale_users = self.repository.users_last_seen_before(cutoff).await?;
        let repository = self.repository.clone();

        let summary = run_round(stale_users, self.concurrency_cap, Duration::from_secs(30), move |user_id| {
            let repository = repository.clone();
            async move { repository.mark_offline(user_id).await.map_err(|e| e.to_string()) }
        })
        .await;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct FakeRepository {
        stale: Vec<Uuid>,
        marked_offline: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl PresenceRepository for FakeRepository {
        async fn users_last_seen_before(&self, _cutoff: DateTime<Utc>) -> CoreResult<Vec<Uuid>> {
            Ok(self.stale.clone())
        }
        async fn mark_offline(&self, user_id: Uuid) -> CoreResult<()> {
            self.marked_offline.lock().await.push(user_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stale_users_are_marked_offline() {
        let user_id = Uuid::new_v4();
        let repository = Arc::new(FakeRepository { stale: vec![user_id], marked_offline: Mutex::new(Vec::new()) });
        let reaper = PresenceReaper::new(repository.clone(), Duration::from_secs(300), 8);

        let summary = reaper.run_round(Utc::now()).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(repository.marked_offline.lock().await.as_slice(), &[user_id]);
    }
}
