//! Standalone process entry point: wires an [`OrchestrationCore`] from the
//! environment and keeps its background maintenance pipelines (checkpoint GC,
//! presence reaping) running until shutdown. No transport layer is started
//! here (Non-goal) — an embedder links this crate directly instead.

use std::sync::Arc;

use agent_orchestration_core::agents::AgentRegistry;
use agent_orchestration_core::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use agent_orchestration_core::config::CoreConfig;
use agent_orchestration_core::error::{CoreError, CoreResult};
use agent_orchestration_core::memory::SharedMemoryStore;
use agent_orchestration_core::repository::{DocumentMetadata, DocumentRepository};
use agent_orchestration_core::OrchestrationCore;
use async_trait::async_trait;
use uuid::Uuid;

/// No document store is in scope for this crate (Non-goal: storage engines
/// are accessed through narrow interfaces, not implemented here). This stub
/// lets the standalone binary host the background pipelines without an
/// embedder having wired up a real document repository; any inbound
/// edit-proposal call through it fails fast rather than silently no-opping.
struct UnconfiguredDocuments;

#[async_trait]
impl DocumentRepository for UnconfiguredDocuments {
    async fn get_document(&self, _doc_id: Uuid) -> CoreResult<DocumentMetadata> {
        Err(CoreError::FatalConfig("no document repository configured for this process".into()))
    }

    async fn update_file_size(&self, _doc_id: Uuid, _size: u64) -> CoreResult<()> {
        Err(CoreError::FatalConfig("no document repository configured for this process".into()))
    }

    async fn update_status(
        &self,
        _doc_id: Uuid,
        _status: agent_orchestration_core::repository::DocumentStatus,
    ) -> CoreResult<()> {
        Err(CoreError::FatalConfig("no document repository configured for this process".into()))
    }

    async fn read_body(&self, _doc_id: Uuid) -> CoreResult<String> {
        Err(CoreError::FatalConfig("no document repository configured for this process".into()))
    }

    async fn write_body(&self, _doc_id: Uuid, _text: &str) -> CoreResult<()> {
        Err(CoreError::FatalConfig("no document repository configured for this process".into()))
    }

    async fn delete_chunks(&self, _doc_id: Uuid) -> CoreResult<()> {
        Err(CoreError::FatalConfig("no document repository configured for this process".into()))
    }

    async fn find_by_path(&self, _path: &str, _user_id: Uuid) -> CoreResult<Option<Uuid>> {
        Err(CoreError::FatalConfig("no document repository configured for this process".into()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = CoreConfig::from_env()?;
    log::info!("agent-orchestration-core starting, checkpoint_db={}", config.checkpoint_db_path);

    let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::open(&config.checkpoint_db_path)?);
    let core = OrchestrationCore::new(
        Arc::new(AgentRegistry::new()),
        Arc::new(SharedMemoryStore::new()),
        checkpoint_store,
        Arc::new(UnconfiguredDocuments),
        config,
    )?;

    let pipeline_handles = core.spawn_background_pipelines();
    log::info!("background pipelines running: checkpoint_gc, presence_reaper");

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received, stopping pipelines");
    for handle in pipeline_handles {
        handle.abort();
    }

    Ok(())
}
