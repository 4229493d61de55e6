//! Outbound storage interfaces (§6): narrow seams the core calls out through
//! rather than owns. None of these traits has a real implementation in this
//! crate — a caller wires up its own document store, vector store, graph
//! store and event transport and hands them to [`crate::OrchestrationCore`].
//!
//! Mirrors how `llm::LlmClient` and `pipelines::feed::FeedRepository` are
//! kept thin rather than modelled after any one backend: each trait exposes
//! exactly the operations §6 lists for that collaborator, nothing more.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreResult;

/// Lifecycle status of a document as tracked by the document repository.
/// Distinct from an edit proposal's own lifecycle (open/applied/expired),
/// which is tracked separately by the Proposal Registry (component J).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Ready,
    Processing,
    Failed,
}

/// A folder-scoped collection a document can belong to, passed through to
/// the folder service unchanged (§6 "folder_id, user_id, collection_type").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    Manuscript,
    Reference,
    Research,
}

#[derive(Debug, Clone)]
pub struct DocumentMetadata {
    pub document_id: Uuid,
    pub owner_id: Uuid,
    pub file_size: u64,
    pub status: DocumentStatus,
}

/// A chunk handed to the vector store for embedding, keyed to the document
/// it was extracted from.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub chunk_index: usize,
    pub text: String,
    pub metadata: Option<Value>,
}

/// §6 "Document repository": metadata lookups, status transitions, and raw
/// body I/O for a document. `read_body`/`write_body` are what the Edit
/// Resolver (component C) and the edit-proposal apply path read and write
/// through — the resolver itself only ever sees a `&str`.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn get_document(&self, doc_id: Uuid) -> CoreResult<DocumentMetadata>;
    async fn update_file_size(&self, doc_id: Uuid, size: u64) -> CoreResult<()>;
    async fn update_status(&self, doc_id: Uuid, status: DocumentStatus) -> CoreResult<()>;
    async fn read_body(&self, doc_id: Uuid) -> CoreResult<String>;
    async fn write_body(&self, doc_id: Uuid, text: &str) -> CoreResult<()>;
    async fn delete_chunks(&self, doc_id: Uuid) -> CoreResult<()>;
    async fn find_by_path(&self, path: &str, user_id: Uuid) -> CoreResult<Option<Uuid>>;
}

/// §6 "Folder service": resolves a document's on-disk (or object-store)
/// path from its folder placement. The core never constructs paths itself.
#[async_trait]
pub trait FolderService: Send + Sync {
    async fn get_document_file_path(
        &self,
        filename: &str,
        folder_id: Uuid,
        user_id: Uuid,
        collection_type: CollectionType,
    ) -> CoreResult<String>;
}

/// §6 "Vector store": embedding and chunk lifecycle, keyed by `doc_id`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn embed_and_store_chunks(&self, chunks: Vec<DocumentChunk>, doc_id: Uuid) -> CoreResult<()>;
    async fn delete_document_chunks(&self, doc_id: Uuid) -> CoreResult<()>;
}

/// §6 "Knowledge graph": best-effort cleanup only. A failure here must log
/// and continue rather than abort the caller's larger operation (e.g. a
/// document delete that has already removed the document row).
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn delete_document_entities(&self, doc_id: Uuid) -> CoreResult<()>;
}

/// §6 "Event sink": fan-out for workflow/conversation events to whatever
/// transport a caller has wired up. Unordered across channels, ordered
/// within one channel — the same guarantee `events::EventBus` gives its
/// in-process subscribers, just extended to an external sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, channel_id: Uuid, event: Value) -> CoreResult<()>;
}

/// Runs a knowledge-graph cleanup and swallows any failure into a log line,
/// per §6's "best-effort; failures log, do not abort" contract. Called from
/// the document-delete path so a graph-store hiccup never blocks the
/// document and vector-store deletes that already happened.
pub async fn best_effort_delete_entities(graph: &dyn KnowledgeGraph, doc_id: Uuid) {
    if let Err(e) = graph.delete_document_entities(doc_id).await {
        log::warn!("knowledge graph cleanup failed for document {doc_id}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FailingGraph {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl KnowledgeGraph for FailingGraph {
        async fn delete_document_entities(&self, _doc_id: Uuid) -> CoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::CoreError::Transient("graph store unreachable".into()))
        }
    }

    #[tokio::test]
    async fn best_effort_delete_swallows_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = FailingGraph { calls: calls.clone() };
        best_effort_delete_entities(&graph, Uuid::new_v4()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
