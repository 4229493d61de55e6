//! Agent Orchestration Core: a scheduler/state-machine/shared-memory
//! substrate for a conversational multi-agent workspace backend.
//!
//! [`OrchestrationCore`] is the crate's facade: it owns the Workflow Engine
//! (component E), the Proposal Registry (component J), the Continuity
//! Tracker's persisted state (component G), and the Messaging & Presence
//! Core (component I), and exposes the external interfaces an HTTP/
//! WebSocket transport layer would wrap (§6) as plain async methods. No
//! transport layer is built here (Non-goal, §1).

pub mod agents;
pub mod checkpoint;
pub mod config;
pub mod continuity;
pub mod edit;
pub mod error;
pub mod events;
pub mod llm;
pub mod memory;
pub mod messaging;
pub mod pipelines;
pub mod principal;
pub mod repository;
pub mod tools;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use agents::AgentRegistry;
use checkpoint::CheckpointStore;
use config::CoreConfig;
use continuity::{ContinuityState, ContinuityStore};
use edit::{
    apply_resolved_edits, resolve_batch, ContentEdit, ContentEditMode, EditProposal, EditType,
    ProposalRegistry,
};
use error::{CoreError, CoreResult};
use events::{ConversationEvent, EventBus, Subscription, WorkflowEvent};
use memory::SharedMemoryStore;
use messaging::MessagingStore;
use pipelines::{CheckpointGc, PresenceReaper};
use principal::Principal;
use repository::DocumentRepository;
use workflow::{StepSpec, WorkflowEngine, WorkflowStatusSummary};

/// §6 "template_name | plan": either start a registered template or submit
/// a caller-built dynamic DAG.
pub enum WorkflowStart {
    Template { name: String },
    Plan { steps: Vec<StepSpec>, max_parallel: Option<usize> },
}

#[derive(Debug, Clone, Copy)]
pub struct CancelOutcome {
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ProposeEditOutcome {
    pub proposal_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct ApplyEditOutcome {
    pub applied_count: usize,
    pub document_id: Uuid,
    pub idempotent: bool,
}

/// The crate's facade type. One instance per process; every inbound
/// operation of §6 is a method here.
pub struct OrchestrationCore {
    workflow_engine: Arc<WorkflowEngine>,
    event_bus: Arc<EventBus>,
    proposals: Arc<ProposalRegistry>,
    continuity: Arc<ContinuityStore>,
    documents: Arc<dyn DocumentRepository>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    messaging: Arc<MessagingStore>,
    config: CoreConfig,
}

impl OrchestrationCore {
    /// Wires the Workflow Engine, Proposal Registry, Continuity state and
    /// Messaging store from the collaborators and outbound interfaces a
    /// caller supplies. `documents` is the only outbound interface this
    /// facade calls directly (the edit-proposal apply path); the rest of
    /// `repository`'s traits are consumed by whatever ingest/transport
    /// layer a caller builds around this core.
    pub fn new(
        agent_registry: Arc<AgentRegistry>,
        shared_memory: Arc<SharedMemoryStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        documents: Arc<dyn DocumentRepository>,
        config: CoreConfig,
    ) -> CoreResult<Self> {
        let event_bus = Arc::new(EventBus::new());
        let workflow_engine = Arc::new(WorkflowEngine::new(
            agent_registry,
            shared_memory,
            checkpoint_store.clone(),
            event_bus.clone(),
            config.clone(),
        ));
        let messaging = Arc::new(messaging::build_store(&config)?);

        Ok(Self {
            workflow_engine,
            event_bus,
            proposals: Arc::new(ProposalRegistry::new()),
            continuity: Arc::new(ContinuityStore::new()),
            documents,
            checkpoint_store,
            messaging,
            config,
        })
    }

    /// Direct access to the Messaging & Presence Core (component I); its
    /// own CRUD surface is not part of §6's external interfaces, so it is
    /// exposed as-is rather than re-wrapped here.
    pub fn messaging(&self) -> &Arc<MessagingStore> {
        &self.messaging
    }

    /// Spawns the Checkpoint GC and Presence Reaper background pipelines
    /// (component H) on the configured intervals. The Feed pipeline is not
    /// spawned here: it needs an HTTP client and RSS/Atom parser the core
    /// does not implement (Non-goal), so a caller wires that one up itself.
    pub fn spawn_background_pipelines(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let gc = Arc::new(CheckpointGc::new(
            self.checkpoint_store.clone(),
            Duration::from_secs(self.config.checkpoint_retention_hours.max(0) as u64 * 3600),
        ));
        let gc_handle = pipelines::spawn_periodic(
            "checkpoint_gc",
            Duration::from_secs(self.config.checkpoint_gc_interval_secs),
            move || {
                let gc = gc.clone();
                async move {
                    match gc.run_round().await {
                        Ok(removed) => pipelines::BatchSummary { attempted: removed, succeeded: removed, failed: 0, errors: vec![] },
                        Err(e) => pipelines::BatchSummary { attempted: 1, succeeded: 0, failed: 1, errors: vec![e.to_string()] },
                    }
                }
            },
        );

        let reaper = Arc::new(PresenceReaper::new(
            Arc::new(self.messaging.clone()),
            Duration::from_secs(self.config.presence_offline_threshold_secs.max(0) as u64),
            self.config.feed_poll_concurrency,
        ));
        let reaper_handle = pipelines::spawn_periodic(
            "presence_reaper",
            Duration::from_secs(self.config.presence_reap_interval_secs),
            move || {
                let reaper = reaper.clone();
                async move { reaper.run_round(Utc::now()).await.unwrap_or_default() }
            },
        );

        vec![gc_handle, reaper_handle]
    }

    /// §6 `start_workflow(principal, template_name | plan, user_context) →
    /// workflow_id`.
    pub fn start_workflow(
        &self,
        principal: Principal,
        conversation_id: Uuid,
        original_query: String,
        persona: Option<String>,
        start: WorkflowStart,
    ) -> CoreResult<Uuid> {
        match start {
            WorkflowStart::Template { name } => {
                self.workflow_engine.start_workflow(principal, conversation_id, &name, original_query, persona)
            }
            WorkflowStart::Plan { steps, max_parallel } => {
                self.workflow_engine.start_dynamic_workflow(principal, conversation_id, original_query, persona, steps, max_parallel)
            }
        }
    }

    /// §6 `get_workflow_status(principal, workflow_id) → {...}`.
    pub fn get_workflow_status(&self, workflow_id: Uuid) -> CoreResult<WorkflowStatusSummary> {
        self.workflow_engine.get_workflow_status(workflow_id)
    }

    /// §6 `cancel_workflow(principal, workflow_id) → {cancelled: bool}`. An
    /// already-finished or unknown workflow id is reported as
    /// `cancelled: false` rather than an error — cancelling something that
    /// can no longer be cancelled is not a caller mistake worth surfacing
    /// as a failure.
    pub fn cancel_workflow(&self, workflow_id: Uuid) -> CoreResult<CancelOutcome> {
        match self.workflow_engine.cancel_workflow(workflow_id) {
            Ok(()) => Ok(CancelOutcome { cancelled: true }),
            Err(CoreError::NotFound(_)) => Ok(CancelOutcome { cancelled: false }),
            Err(e) => Err(e),
        }
    }

    /// §6 `subscribe_workflow_events(principal, workflow_id) → stream of events`.
    pub fn subscribe_workflow_events(&self, workflow_id: Uuid) -> Subscription<WorkflowEvent> {
        self.workflow_engine.subscribe_workflow_events(workflow_id)
    }

    /// §6 `subscribe_conversation(principal, conversation_id) → stream of
    /// {type, data, timestamp}`.
    pub fn subscribe_conversation(&self, conversation_id: Uuid) -> Subscription<ConversationEvent> {
        self.event_bus.subscribe_conversation(conversation_id)
    }

    /// §6 `propose_edit(principal, proposal) → {proposal_id}`. Also
    /// publishes `edit_proposal_created` on `conversation_id`'s stream, one
    /// of the three event types `subscribe_conversation` names.
    pub fn propose_edit(&self, principal: &Principal, conversation_id: Uuid, proposal: EditProposal) -> CoreResult<ProposeEditOutcome> {
        if !principal.can_access(proposal.user_id) {
            return Err(CoreError::AccessDenied(format!(
                "principal {} may not propose edits on behalf of user {}",
                principal.user_id, proposal.user_id
            )));
        }
        let document_id = proposal.document_id;
        let proposal_id = self.proposals.create(proposal);
        self.event_bus.publish_conversation(ConversationEvent::EditProposalCreated {
            conversation_id,
            proposal_id,
            document_id,
            at: Utc::now(),
        });
        Ok(ProposeEditOutcome { proposal_id })
    }

    /// §6 `apply_edit_proposal(principal, proposal_id, selected_op_indices?)
    /// → {applied_count, document_id, idempotent}`. Re-applying an
    /// already-applied proposal is idempotent (I6): it returns
    /// `applied_count: 0, idempotent: true` rather than re-splicing the
    /// document or erroring.
    pub async fn apply_edit_proposal(
        &self,
        principal: &Principal,
        proposal_id: Uuid,
        selected_op_indices: Option<Vec<usize>>,
    ) -> CoreResult<ApplyEditOutcome> {
        let proposal = self.proposals.get(proposal_id)?;
        if !principal.can_access(proposal.user_id) {
            return Err(CoreError::AccessDenied(format!(
                "principal {} may not apply edit proposal {proposal_id}",
                principal.user_id
            )));
        }

        let document_id = proposal.document_id;
        let outcome = self.proposals.apply(proposal_id)?;
        if !outcome.newly_applied {
            return Ok(ApplyEditOutcome { applied_count: 0, document_id, idempotent: true });
        }

        let applied_count = match proposal.edit_type {
            EditType::Operations => {
                let mut operations = proposal.operations.unwrap_or_default();
                if let Some(indices) = &selected_op_indices {
                    operations = indices.iter().filter_map(|&i| operations.get(i).cloned()).collect();
                }
                let body = self.documents.read_body(document_id).await?;
                let batch = resolve_batch(&body, operations, 0, None);
                let new_body = apply_resolved_edits(&body, &batch.resolved);
                self.documents.write_body(document_id, &new_body).await?;
                self.documents.update_file_size(document_id, new_body.len() as u64).await?;
                batch.resolved.len()
            }
            EditType::Content => {
                let content_edit = proposal
                    .content_edit
                    .ok_or_else(|| CoreError::BadInput(format!("proposal {proposal_id} has no content_edit payload")))?;
                let body = self.documents.read_body(document_id).await?;
                let new_body = apply_content_edit(&body, &content_edit);
                self.documents.write_body(document_id, &new_body).await?;
                self.documents.update_file_size(document_id, new_body.len() as u64).await?;
                1
            }
        };

        Ok(ApplyEditOutcome { applied_count, document_id, idempotent: false })
    }

    /// §6 `get_continuity(principal, manuscript_id) → ContinuityState`. The
    /// state is keyed by `(principal.user_id, manuscript_id)` — a principal
    /// only ever reads its own tracked manuscript state through this call.
    pub fn get_continuity(&self, principal: &Principal, manuscript_id: Uuid) -> CoreResult<ContinuityState> {
        self.continuity.get(principal.user_id, manuscript_id)
    }

    /// Persists an updated continuity state, called after a continuity
    /// agent step folds a new chapter in (§4.7). Not itself one of §6's
    /// inbound operations: it is how `get_continuity` has anything to
    /// return.
    pub fn record_continuity(&self, state: ContinuityState) {
        self.continuity.upsert(state);
    }
}

fn apply_content_edit(body: &str, edit: &ContentEdit) -> String {
    match edit.mode {
        ContentEditMode::Append => format!("{body}{}", edit.content),
        ContentEditMode::Replace => edit.content.clone(),
        ContentEditMode::InsertAt => {
            let pos = edit.insert_position.unwrap_or(body.len()).min(body.len());
            let mut out = String::with_capacity(body.len() + edit.content.len());
            out.push_str(&body[..pos]);
            out.push_str(&edit.content);
            out.push_str(&body[pos..]);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agents::{Agent, AgentNodeInput, AgentResult, ExecutionStatus};
    use async_trait::async_trait;
    use checkpoint::SqliteCheckpointStore;
    use edit::{EditorOperation, OpType};
    use principal::Role;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    struct StubAgent;

    #[async_trait]
    impl Agent for StubAgent {
        fn capabilities(&self) -> &[String] {
            &[]
        }
        async fn process(&self, _input: AgentNodeInput) -> CoreResult<AgentResult> {
            Ok(AgentResult {
                agent_type: "research".into(),
                execution_id: Uuid::new_v4(),
                status: ExecutionStatus::Success,
                response: "done".into(),
                data_outputs: Default::default(),
                tools_used: vec![],
                execution_time: StdDuration::from_millis(1),
                timestamp: Utc::now(),
                confidence_score: Some(0.9),
                error_message: None,
                metadata: Default::default(),
            })
        }
    }

    struct InMemoryDocuments {
        bodies: Mutex<HashMap<Uuid, String>>,
    }

    #[async_trait]
    impl DocumentRepository for InMemoryDocuments {
        async fn get_document(&self, doc_id: Uuid) -> CoreResult<repository::DocumentMetadata> {
            Ok(repository::DocumentMetadata {
                document_id: doc_id,
                owner_id: doc_id,
                file_size: 0,
                status: repository::DocumentStatus::Ready,
            })
        }
        async fn update_file_size(&self, _doc_id: Uuid, _size: u64) -> CoreResult<()> {
            Ok(())
        }
        async fn update_status(&self, _doc_id: Uuid, _status: repository::DocumentStatus) -> CoreResult<()> {
            Ok(())
        }
        async fn read_body(&self, doc_id: Uuid) -> CoreResult<String> {
            self.bodies
                .lock()
                .unwrap()
                .get(&doc_id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("document {doc_id}")))
        }
        async fn write_body(&self, doc_id: Uuid, text: &str) -> CoreResult<()> {
            self.bodies.lock().unwrap().insert(doc_id, text.to_string());
            Ok(())
        }
        async fn delete_chunks(&self, _doc_id: Uuid) -> CoreResult<()> {
            Ok(())
        }
        async fn find_by_path(&self, _path: &str, _user_id: Uuid) -> CoreResult<Option<Uuid>> {
            Ok(None)
        }
    }

    fn test_core(documents: Arc<InMemoryDocuments>) -> OrchestrationCore {
        let mut registry = AgentRegistry::new();
        registry.register("research", || Arc::new(StubAgent));
        OrchestrationCore::new(
            Arc::new(registry),
            Arc::new(SharedMemoryStore::new()),
            Arc::new(SqliteCheckpointStore::in_memory().unwrap()),
            documents,
            CoreConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn apply_edit_proposal_splices_the_resolved_operation_into_the_document() {
        let document_id = Uuid::new_v4();
        let documents = Arc::new(InMemoryDocuments { bodies: Mutex::new(HashMap::from([(document_id, "hello world".to_string())])) });
        let core = test_core(documents.clone());
        let user_id = Uuid::new_v4();
        let principal = Principal::new(user_id, Role::User);

        let operation = EditorOperation {
            op_type: OpType::ReplaceRange,
            start: None,
            end: None,
            text: Some("there".into()),
            original_text: Some("world".into()),
            anchor_text: None,
            occurrence_index: 0,
            confidence: 1.0,
        };
        let proposal = EditProposal::new_operations(document_id, vec![operation], "writer_agent", "swap greeting", user_id, true);

        let propose = core.propose_edit(&principal, Uuid::new_v4(), proposal).unwrap();
        let applied = core.apply_edit_proposal(&principal, propose.proposal_id, None).await.unwrap();
        assert_eq!(applied.applied_count, 1);
        assert!(!applied.idempotent);
        assert_eq!(documents.bodies.lock().unwrap()[&document_id], "hello there");

        let replay = core.apply_edit_proposal(&principal, propose.proposal_id, None).await.unwrap();
        assert!(replay.idempotent);
        assert_eq!(replay.applied_count, 0);
    }

    #[test]
    fn non_owner_cannot_propose_edit_for_another_user() {
        let documents = Arc::new(InMemoryDocuments { bodies: Mutex::new(HashMap::new()) });
        let core = test_core(documents);
        let principal = Principal::new(Uuid::new_v4(), Role::User);
        let proposal = EditProposal::new_operations(Uuid::new_v4(), vec![], "writer_agent", "x", Uuid::new_v4(), true);
        assert!(matches!(core.propose_edit(&principal, Uuid::new_v4(), proposal), Err(CoreError::AccessDenied(_))));
    }

    #[test]
    fn unknown_manuscript_continuity_is_not_found() {
        let documents = Arc::new(InMemoryDocuments { bodies: Mutex::new(HashMap::new()) });
        let core = test_core(documents);
        let principal = Principal::new(Uuid::new_v4(), Role::User);
        assert!(matches!(core.get_continuity(&principal, Uuid::new_v4()), Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancelling_an_unknown_workflow_reports_not_cancelled_rather_than_erroring() {
        let documents = Arc::new(InMemoryDocuments { bodies: Mutex::new(HashMap::new()) });
        let core = test_core(documents);
        let outcome = core.cancel_workflow(Uuid::new_v4()).unwrap();
        assert!(!outcome.cancelled);
    }
}
