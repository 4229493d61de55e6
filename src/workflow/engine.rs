//! `WorkflowEngine` (§4.5, component E): the public facade over workflow
//! lifecycle — start, inspect, cancel, and subscribe — with the scheduling
//! loop itself running on a spawned task per workflow, mirroring
//! `agent_workflow_engine.py`'s `execute_workflow` being an async generator
//! the caller drives from a separate coroutine.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::checkpoint::CheckpointStore;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, Subscription, WorkflowEvent};
use crate::memory::SharedMemoryStore;
use crate::principal::Principal;

use super::scheduler::{run_workflow, SchedulerContext};
use super::templates::TemplateRegistry;
use super::types::{Step, StepSpec, StepStatus, UserContext, Workflow, WorkflowStatus, WorkflowStatusSummary};

pub struct WorkflowEngine {
    agent_registry: Arc<AgentRegistry>,
    shared_memory: Arc<SharedMemoryStore>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    event_bus: Arc<EventBus>,
    templates: TemplateRegistry,
    config: CoreConfig,
    workflows: DashMap<Uuid, Arc<RwLock<Workflow>>>,
    cancel_senders: DashMap<Uuid, watch::Sender<bool>>,
}

impl WorkflowEngine {
    pub fn new(
        agent_registry: Arc<AgentRegistry>,
        shared_memory: Arc<SharedMemoryStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        event_bus: Arc<EventBus>,
        config: CoreConfig,
    ) -> Self {
        Self {
            agent_registry,
            shared_memory,
            checkpoint_store,
            event_bus,
            templates: TemplateRegistry::new(),
            config,
            workflows: DashMap::new(),
            cancel_senders: DashMap::new(),
        }
    }

    /// Register an additional template at startup, beyond the three shipped
    /// ones (§4.5: "new ones can be registered at startup").
    pub fn register_template(&mut self, template: super::templates::WorkflowTemplate) {
        self.templates.register(template);
    }

    /// Start a named template workflow. Returns the `workflow_id`
    /// immediately; execution runs on a spawned task (§6's async-kickoff
    /// semantics — callers watch progress via `subscribe_workflow_events`).
    pub fn start_workflow(&self, principal: Principal, conversation_id: Uuid, template_name: &str, original_query: String, persona: Option<String>) -> CoreResult<Uuid> {
        let (steps, max_parallel) = self.templates.build_steps(template_name)?;
        let user_context = UserContext {
            principal,
            conversation_id,
            original_query,
            persona,
            extra: Default::default(),
        };
        self.spawn_workflow(Some(template_name.to_string()), user_context, steps, max_parallel)
    }

    /// Start a caller-submitted dynamic plan, validated the same way a
    /// template's steps are before it is accepted (§4.5).
    pub fn start_dynamic_workflow(
        &self,
        principal: Principal,
        conversation_id: Uuid,
        original_query: String,
        persona: Option<String>,
        plan: Vec<StepSpec>,
        max_parallel: Option<usize>,
    ) -> CoreResult<Uuid> {
        let steps: Vec<Step> = plan
            .into_iter()
            .map(|spec| Step {
                step_id: spec.step_id,
                agent_type: spec.agent_type,
                task_description: spec.task_description,
                input_requirements: spec.input_requirements,
                output_specifications: spec.output_specifications,
                depends_on: spec.depends_on,
                status: StepStatus::Pending,
                retry_count: 0,
                max_retries: spec.max_retries.unwrap_or(self.config.max_retries_default),
                result: None,
                failure_reason: None,
                retry_not_before: None,
            })
            .collect();

        let known_agent_types = self.agent_registry.registered_types().into_iter().map(str::to_string).collect();
        super::templates::validate_plan(&steps, &known_agent_types)?;

        let user_context = UserContext {
            principal,
            conversation_id,
            original_query,
            persona,
            extra: Default::default(),
        };
        self.spawn_workflow(None, user_context, steps, max_parallel.unwrap_or(self.config.max_parallel_default))
    }

    /// Sequential chain mode (no DAG, no template): each step depends only
    /// on the one before it, in the order given.
    pub fn execute_simple_chain(&self, principal: Principal, conversation_id: Uuid, original_query: String, agent_types: Vec<String>) -> CoreResult<Uuid> {
        if agent_types.is_empty() {
            return Err(CoreError::BadInput("simple chain requires at least one agent".into()));
        }

        let mut steps = Vec::with_capacity(agent_types.len());
        for (i, agent_type) in agent_types.into_iter().enumerate() {
            let step_id = format!("chain_step_{i}");
            let depends_on = if i == 0 {
                Default::default()
            } else {
                [format!("chain_step_{}", i - 1)].into_iter().collect()
            };
            steps.push(Step {
                step_id,
                agent_type,
                task_description: "Continue the chain with the prior step's output".to_string(),
                input_requirements: vec![],
                output_specifications: vec![],
                depends_on,
                status: StepStatus::Pending,
                retry_count: 0,
                max_retries: self.config.max_retries_default,
                result: None,
                failure_reason: None,
                retry_not_before: None,
            });
        }

        let known_agent_types = self.agent_registry.registered_types().into_iter().map(str::to_string).collect();
        super::templates::validate_plan(&steps, &known_agent_types)?;

        let user_context = UserContext {
            principal,
            conversation_id,
            original_query,
            persona: None,
            extra: Default::default(),
        };
        self.spawn_workflow(None, user_context, steps, self.config.max_parallel_default)
    }

    fn spawn_workflow(&self, template_name: Option<String>, user_context: UserContext, steps: Vec<Step>, max_parallel: usize) -> CoreResult<Uuid> {
        let workflow_id = Uuid::new_v4();
        let workflow = Workflow {
            workflow_id,
            template_name,
            status: WorkflowStatus::Pending,
            created_at: chrono::Utc::now(),
            completed_at: None,
            user_context: user_context.clone(),
            steps,
            max_parallel,
            handoffs: Vec::new(),
        };
        let handle = Arc::new(RwLock::new(workflow));
        self.workflows.insert(workflow_id, handle.clone());

        let (tx, rx) = watch::channel(false);
        self.cancel_senders.insert(workflow_id, tx);

        let ctx = Arc::new(SchedulerContext {
            agent_registry: self.agent_registry.clone(),
            shared_memory: self.shared_memory.clone(),
            checkpoint_store: self.checkpoint_store.clone(),
            event_bus: self.event_bus.clone(),
            scheduler_max_rounds: self.config.scheduler_max_rounds,
            principal: user_context.principal,
            conversation_id: user_context.conversation_id,
        });

        tokio::spawn(run_workflow(handle, ctx, rx));
        Ok(workflow_id)
    }

    pub fn get_workflow_status(&self, workflow_id: Uuid) -> CoreResult<WorkflowStatusSummary> {
        let handle = self.workflow_handle(workflow_id)?;
        let wf = handle.read();
        let completed_steps = wf.completed_step_ids().len();
        let failed_steps = wf.failed_step_ids().len();
        let current_step = wf.steps.iter().find(|s| s.status == StepStatus::Running).map(|s| s.step_id.clone());
        let execution_time_secs = wf
            .completed_at
            .map(|end| (end - wf.created_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_else(|| (chrono::Utc::now() - wf.created_at).num_milliseconds() as f64 / 1000.0);

        Ok(WorkflowStatusSummary {
            status: wf.status,
            completed_steps,
            total_steps: wf.steps.len(),
            failed_steps,
            current_step,
            execution_time_secs,
        })
    }

    /// Signal cancellation. The scheduler observes this within one round or
    /// one in-flight step's 5s cooperative grace period (§5).
    pub fn cancel_workflow(&self, workflow_id: Uuid) -> CoreResult<()> {
        let sender = self
            .cancel_senders
            .get(&workflow_id)
            .ok_or_else(|| CoreError::NotFound(format!("workflow {workflow_id}")))?;
        let _ = sender.send(true);
        Ok(())
    }

    pub fn subscribe_workflow_events(&self, workflow_id: Uuid) -> Subscription<WorkflowEvent> {
        self.event_bus.subscribe_workflow(workflow_id)
    }

    fn workflow_handle(&self, workflow_id: Uuid) -> CoreResult<Arc<RwLock<Workflow>>> {
        self.workflows
            .get(&workflow_id)
            .map(|w| w.clone())
            .ok_or_else(|| CoreError::NotFound(format!("workflow {workflow_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, AgentNodeInput, AgentResult, ExecutionStatus};
    use crate::checkpoint::SqliteCheckpointStore;
    use crate::principal::Role;
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubAgent(&'static str);

    #[async_trait]
    impl Agent for StubAgent {
        fn capabilities(&self) -> &[String] {
            &[]
        }

        async fn process(&self, _input: AgentNodeInput) -> CoreResult<AgentResult> {
            Ok(AgentResult {
                agent_type: self.0.into(),
                execution_id: Uuid::new_v4(),
                status: ExecutionStatus::Success,
                response: format!("{} done", self.0),
                data_outputs: Default::default(),
                tools_used: vec![],
                execution_time: Duration::from_millis(1),
                timestamp: chrono::Utc::now(),
                confidence_score: Some(0.9),
                error_message: None,
                metadata: Default::default(),
            })
        }
    }

    fn test_engine() -> WorkflowEngine {
        let mut registry = AgentRegistry::new();
        for agent_type in ["research", "analysis", "synthesis", "coding"] {
            let name: &'static str = Box::leak(agent_type.to_string().into_boxed_str());
            registry.register(agent_type, move || Arc::new(StubAgent(name)));
        }
        WorkflowEngine::new(
            Arc::new(registry),
            Arc::new(SharedMemoryStore::new()),
            Arc::new(SqliteCheckpointStore::in_memory().unwrap()),
            Arc::new(EventBus::new()),
            CoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn template_workflow_runs_to_completion() {
        let engine = test_engine();
        let principal = Principal::new(Uuid::new_v4(), Role::User);
        let conversation_id = Uuid::new_v4();

        let workflow_id = engine
            .start_workflow(principal, conversation_id, "research_analysis_synthesis", "test query".into(), None)
            .unwrap();

        let mut sub = engine.subscribe_workflow_events(workflow_id);
        loop {
            match sub.recv().await {
                Some(WorkflowEvent::WorkflowCompleted { .. }) => break,
                Some(WorkflowEvent::WorkflowError { .. }) => panic!("workflow should have succeeded"),
                Some(_) => continue,
                None => panic!("event stream closed before completion"),
            }
        }

        let status = engine.get_workflow_status(workflow_id).unwrap();
        assert_eq!(status.status, WorkflowStatus::Completed);
        assert_eq!(status.completed_steps, 3);
    }

    #[tokio::test]
    async fn unknown_workflow_status_is_not_found() {
        let engine = test_engine();
        assert!(matches!(engine.get_workflow_status(Uuid::new_v4()), Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn simple_chain_runs_steps_in_order() {
        let engine = test_engine();
        let principal = Principal::new(Uuid::new_v4(), Role::User);
        let conversation_id = Uuid::new_v4();

        let workflow_id = engine
            .execute_simple_chain(principal, conversation_id, "chain query".into(), vec!["research".into(), "analysis".into()])
            .unwrap();

        let mut sub = engine.subscribe_workflow_events(workflow_id);
        loop {
            match sub.recv().await {
                Some(WorkflowEvent::WorkflowCompleted { .. }) => break,
                Some(WorkflowEvent::WorkflowError { .. }) => panic!("chain should have succeeded"),
                Some(_) => continue,
                None => panic!("event stream closed before completion"),
            }
        }

        let status = engine.get_workflow_status(workflow_id).unwrap();
        assert_eq!(status.completed_steps, 2);
    }
}
