//! Generic recurring-task scheduler shared by every pipeline (§4.8): a named
//! interval, a concurrency cap, a per-target timeout, and a target handler.
//! Grounded on the same round-based, bounded-parallel shape as
//! `workflow::scheduler`, reused here for timer-driven fan-out instead of
//! dependency-driven fan-out.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;

/// The outcome of one pipeline round: how many targets were attempted, how
/// many succeeded, and the error messages for the ones that didn't.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Run `targets` through `handler`, at most `concurrency_cap` in flight at
/// once, each bounded by `per_target_timeout`. A per-target failure never
/// affects siblings (§4.8: "failure isolation").
pub async fn run_round<T, H, Fut>(targets: Vec<T>, concurrency_cap: usize, per_target_timeout: Duration, handler: H) -> BatchSummary
where
    T: Send + 'static,
    H: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    let mut summary = BatchSummary::default();
    let cap = concurrency_cap.max(1);
    let mut remaining = targets.into_iter();

    loop {
        let batch: Vec<T> = (&mut remaining).take(cap).collect();
        if batch.is_empty() {
            break;
        }

        let mut joins = JoinSet::new();
        for target in batch {
            let handler = handler.clone();
            joins.spawn(async move {
                match tokio::time::timeout(per_target_timeout, handler(target)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some("timed out".to_string()),
                }
            });
        }

        while let Some(joined) = joins.join_next().await {
            summary.attempted += 1;
            match joined {
                Ok(None) => summary.succeeded += 1,
                Ok(Some(err)) => {
                    summary.failed += 1;
                    summary.errors.push(err);
                }
                Err(e) => {
                    summary.failed += 1;
                    summary.errors.push(format!("task panicked: {e}"));
                }
            }
        }
    }

    summary
}

/// Spawn `round` on a fixed `interval` forever, logging a one-line summary
/// after each tick. The returned handle can be aborted to stop the pipeline.
pub fn spawn_periodic<F, Fut>(name: &'static str, interval: Duration, mut round: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = BatchSummary> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let summary = round().await;
            if summary.attempted > 0 || !summary.errors.is_empty() {
                log::info!(
                    "pipeline={name} attempted={} succeeded={} failed={}",
                    summary.attempted,
                    summary.succeeded,
                    summary.failed
                );
            }
            for error in &summary.errors {
                log::warn!("pipeline={name} target failed: {error}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn batches_respect_concurrency_cap_and_collate_failures() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let targets: Vec<i32> = (0..10).collect();

        let concurrent_clone = concurrent.clone();
        let max_seen_clone = max_seen.clone();
        let summary = run_round(targets, 3, Duration::from_secs(1), move |t| {
            let concurrent = concurrent_clone.clone();
            let max_seen = max_seen_clone.clone();
            async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                if t % 4 == 0 {
                    Err(format!("target {t} failed"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(summary.attempted, 10);
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.succeeded, 7);
    }

    #[tokio::test]
    async fn per_target_timeout_is_recorded_as_failure() {
        let summary = run_round(vec![1], 1, Duration::from_millis(10), |_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0], "timed out");
    }
}
