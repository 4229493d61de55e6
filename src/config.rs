//! Runtime configuration loaded from the environment.
//!
//! Corresponds to `spec.md` §6 ("CLI / env"): the core has no CLI surface of
//! its own and reads pool sizes, retention windows, concurrency caps and key
//! material from the environment at startup. Changes require a restart.

use crate::error::CoreError;
use serde::Deserialize;

const ENV_PREFIX: &str = "CORE";

/// Raw deserialization target for the `config` crate's environment source.
/// Every field is optional so a partially-configured environment still
/// loads; `CoreConfig::from_env` fills the rest from documented defaults.
#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    max_parallel_default: Option<usize>,
    max_retries_default: Option<u32>,
    scheduler_max_rounds: Option<u32>,
    checkpoint_retention_hours: Option<i64>,
    proposal_expiry_hours: Option<i64>,
    feed_poll_concurrency: Option<usize>,
    feed_request_timeout_secs: Option<u64>,
    feed_target_timeout_secs: Option<u64>,
    presence_offline_threshold_secs: Option<i64>,
    presence_reap_interval_secs: Option<u64>,
    checkpoint_gc_interval_secs: Option<u64>,
    message_encryption_master_key: Option<String>,
    message_encryption_enabled: Option<bool>,
    checkpoint_db_path: Option<String>,
    messaging_db_path: Option<String>,
    global_workflow_concurrency: Option<usize>,
}

/// All tunables the core's components need, collected in one place so a
/// `Workflow`/`Pipeline`/`CheckpointStore` never reads the environment
/// directly — they're constructed with a `CoreConfig` instead.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Default `max_parallel` for workflows that don't override it.
    pub max_parallel_default: usize,
    /// Default `max_retries` for steps that don't override it.
    pub max_retries_default: u32,
    /// Scheduling-loop round cap per workflow (§4.5 max-iteration guard).
    pub scheduler_max_rounds: u32,
    /// How long after completion an archived workflow's checkpoints live.
    pub checkpoint_retention_hours: i64,
    /// How long an unapplied edit proposal stays live before it expires.
    pub proposal_expiry_hours: i64,
    /// Max feed targets polled concurrently.
    pub feed_poll_concurrency: usize,
    /// Per-HTTP-request timeout for feed fetches.
    pub feed_request_timeout_secs: u64,
    /// Hard per-target timeout for one feed poll, independent of retries.
    pub feed_target_timeout_secs: u64,
    /// Age after which a user with no heartbeat is reaped to `offline`.
    pub presence_offline_threshold_secs: i64,
    /// Interval between presence-reaper sweeps.
    pub presence_reap_interval_secs: u64,
    /// Interval between checkpoint-GC sweeps.
    pub checkpoint_gc_interval_secs: u64,
    /// Base64-encoded 32-byte master key for at-rest message encryption.
    /// Required only when `message_encryption_enabled` is true.
    pub message_encryption_master_key: Option<String>,
    /// Whether messages are encrypted at rest.
    pub message_encryption_enabled: bool,
    /// SQLite file backing the checkpoint store.
    pub checkpoint_db_path: String,
    /// SQLite file backing the messaging log.
    pub messaging_db_path: String,
    /// Max workflows running concurrently across the process.
    pub global_workflow_concurrency: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_parallel_default: 4,
            max_retries_default: 2,
            scheduler_max_rounds: 50,
            checkpoint_retention_hours: 24,
            proposal_expiry_hours: 24,
            feed_poll_concurrency: 8,
            feed_request_timeout_secs: 30,
            feed_target_timeout_secs: 300,
            presence_offline_threshold_secs: 300,
            presence_reap_interval_secs: 30,
            checkpoint_gc_interval_secs: 3600,
            message_encryption_master_key: None,
            message_encryption_enabled: false,
            checkpoint_db_path: "checkpoints.db".to_string(),
            messaging_db_path: "messaging.db".to_string(),
            global_workflow_concurrency: 16,
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables prefixed `CORE_`
    /// (e.g. `CORE_MAX_PARALLEL_DEFAULT`), falling back to documented
    /// defaults for anything unset. Fails with `CoreError::FatalConfig` if
    /// a present variable can't be parsed into its field's type.
    pub fn from_env() -> Result<Self, CoreError> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("_"))
            .build()
            .map_err(|e| CoreError::FatalConfig(format!("reading {ENV_PREFIX}_* env: {e}")))?;

        let raw: RawConfig = source
            .try_deserialize()
            .map_err(|e| CoreError::FatalConfig(format!("malformed {ENV_PREFIX}_* value: {e}")))?;

        let defaults = Self::default();
        let cfg = Self {
            max_parallel_default: raw.max_parallel_default.unwrap_or(defaults.max_parallel_default),
            max_retries_default: raw.max_retries_default.unwrap_or(defaults.max_retries_default),
            scheduler_max_rounds: raw.scheduler_max_rounds.unwrap_or(defaults.scheduler_max_rounds),
            checkpoint_retention_hours: raw
                .checkpoint_retention_hours
                .unwrap_or(defaults.checkpoint_retention_hours),
            proposal_expiry_hours: raw
                .proposal_expiry_hours
                .unwrap_or(defaults.proposal_expiry_hours),
            feed_poll_concurrency: raw
                .feed_poll_concurrency
                .unwrap_or(defaults.feed_poll_concurrency),
            feed_request_timeout_secs: raw
                .feed_request_timeout_secs
                .unwrap_or(defaults.feed_request_timeout_secs),
            feed_target_timeout_secs: raw
                .feed_target_timeout_secs
                .unwrap_or(defaults.feed_target_timeout_secs),
            presence_offline_threshold_secs: raw
                .presence_offline_threshold_secs
                .unwrap_or(defaults.presence_offline_threshold_secs),
            presence_reap_interval_secs: raw
                .presence_reap_interval_secs
                .unwrap_or(defaults.presence_reap_interval_secs),
            checkpoint_gc_interval_secs: raw
                .checkpoint_gc_interval_secs
                .unwrap_or(defaults.checkpoint_gc_interval_secs),
            message_encryption_master_key: raw.message_encryption_master_key,
            message_encryption_enabled: raw
                .message_encryption_enabled
                .unwrap_or(defaults.message_encryption_enabled),
            checkpoint_db_path: raw.checkpoint_db_path.unwrap_or(defaults.checkpoint_db_path),
            messaging_db_path: raw.messaging_db_path.unwrap_or(defaults.messaging_db_path),
            global_workflow_concurrency: raw
                .global_workflow_concurrency
                .unwrap_or(defaults.global_workflow_concurrency),
        };

        if cfg.message_encryption_enabled && cfg.message_encryption_master_key.is_none() {
            return Err(CoreError::FatalConfig(format!(
                "{ENV_PREFIX}_MESSAGE_ENCRYPTION_ENABLED=true but {ENV_PREFIX}_MESSAGE_ENCRYPTION_MASTER_KEY is unset"
            )));
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.max_parallel_default, 4);
        assert_eq!(cfg.max_retries_default, 2);
        assert_eq!(cfg.scheduler_max_rounds, 50);
        assert_eq!(cfg.checkpoint_retention_hours, 24);
        assert_eq!(cfg.feed_poll_concurrency, 8);
        assert_eq!(cfg.feed_target_timeout_secs, 300);
    }

    #[test]
    fn encryption_enabled_without_key_is_fatal() {
        // serial by convention: no other test in this module touches env vars.
        std::env::set_var("CORE_MESSAGE_ENCRYPTION_ENABLED", "true");
        std::env::remove_var("CORE_MESSAGE_ENCRYPTION_MASTER_KEY");
        let result = CoreConfig::from_env();
        std::env::remove_var("CORE_MESSAGE_ENCRYPTION_ENABLED");
        assert!(matches!(result, Err(CoreError::FatalConfig(_))));
    }
}
