//! The scheduling loop (§4.5): ready-set computation, bounded-parallel step
//! execution, retry-on-failure, deadlock cascade, and the max-rounds guard.
//! Grounded on `agent_workflow_engine.py::_execute_workflow_steps`'s
//! round-based loop (`get_next_ready_step`, the 50-iteration cap, the
//! deadlock-detection fallback), reworked from its single-step-per-round
//! polling loop into bounded-parallel batches per round since this core
//! must honour `max_parallel` (§8 invariant 1) rather than running steps
//! one at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::agents::{Agent, AgentNodeInput, AgentRegistry};
use crate::checkpoint::{CheckpointStore, ThreadId};
use crate::error::CoreError;
use crate::events::{EventBus, WorkflowEvent};
use crate::memory::SharedMemoryStore;
use crate::principal::Principal;

use super::types::{DataHandoff, DataHandoffType, FailureReason, StepStatus, Workflow, WorkflowStatus};

/// Cooperative cancellation bound (§5: "must stop within a bounded time,
/// default 5s of cooperative checkpoints").
const CANCELLATION_GRACE: Duration = Duration::from_secs(5);

/// §5 liveness: a step still in flight emits at least one heartbeat every
/// 30s.
const STEP_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How often the scheduler loop rechecks readiness while every pending step
/// is blocked on a dependency or sitting out a retry backoff.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// §4.5 retry backoff: `min(2^retry_count * 2s, 30s)`, anchored to when the
/// step is requeued.
fn retry_backoff(retry_count: u32) -> chrono::Duration {
    let secs = 2i64.saturating_mul(2i64.saturating_pow(retry_count.min(10)));
    chrono::Duration::seconds(secs.min(30))
}

pub struct SchedulerContext {
    pub agent_registry: Arc<AgentRegistry>,
    pub shared_memory: Arc<SharedMemoryStore>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub event_bus: Arc<EventBus>,
    pub scheduler_max_rounds: u32,
    pub principal: Principal,
    pub conversation_id: Uuid,
}

enum StepOutcome {
    Completed(crate::agents::AgentResult),
    Failed(CoreError),
    Cancelled,
}

/// Drive one workflow from `pending` to a terminal status, publishing
/// typed progress events as it goes. Runs to completion inside whatever
/// task the caller spawns it on; does not return until the workflow is
/// terminal.
pub async fn run_workflow(workflow: Arc<RwLock<Workflow>>, ctx: Arc<SchedulerContext>, cancel_rx: watch::Receiver<bool>) {
    let (workflow_id, template_name, thread) = {
        let wf = workflow.write_then_read_started();
        (wf.workflow_id, wf.template_name.clone(), ThreadId::new(ctx.conversation_id, wf.workflow_id))
    };

    ctx.event_bus.publish_workflow(WorkflowEvent::WorkflowStarted { workflow_id, template: template_name, at: Utc::now() });

    let total_steps = workflow.read().steps.len();
    ctx.event_bus.publish_workflow(WorkflowEvent::WorkflowPlanned { workflow_id, total_steps, at: Utc::now() });

    let mut last_checkpoint_id: Option<i64> = None;
    checkpoint(&ctx, thread, &workflow, &mut last_checkpoint_id).await;

    if total_steps == 0 {
        finish(&ctx, &workflow, workflow_id, thread, &mut last_checkpoint_id).await;
        return;
    }

    let mut round: u32 = 0;
    loop {
        if *cancel_rx.borrow() {
            cancel_remaining_steps(&workflow, &ctx, workflow_id);
            break;
        }

        let (batch, terminal) = {
            let mut wf = workflow.write();
            if wf.is_terminal() {
                (Vec::new(), true)
            } else {
                let ready = wf.ready_steps(Utc::now());
                if ready.is_empty() {
                    cascade_dependency_failures(&mut wf, &ctx, workflow_id);
                    (Vec::new(), wf.is_terminal())
                } else {
                    let max_parallel = wf.max_parallel;
                    (ready.into_iter().take(max_parallel).collect(), false)
                }
            }
        };

        if terminal {
            break;
        }
        if batch.is_empty() {
            // Nothing ready and nothing cascaded this round: every pending
            // step is either waiting on a dependency still running
            // elsewhere, or sitting out its retry backoff
            // (`retry_not_before`). Neither consumes a round of the
            // `scheduler_max_rounds` budget, which only bounds rounds that
            // actually dispatch work; a short poll keeps this from
            // busy-spinning while a backoff elapses.
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            continue;
        }

        round += 1;
        if round > ctx.scheduler_max_rounds {
            let mut wf = workflow.write();
            wf.status = WorkflowStatus::Failed;
            for step in wf.steps.iter_mut() {
                if step.status == StepStatus::Pending {
                    step.status = StepStatus::Failed;
                    step.failure_reason = Some(FailureReason::SchedulerOverflow);
                }
            }
            drop(wf);
            ctx.event_bus.publish_workflow(WorkflowEvent::WorkflowError {
                workflow_id,
                reason: "scheduler_overflow".to_string(),
                at: Utc::now(),
            });
            break;
        }

        run_round(&workflow, &ctx, workflow_id, thread, &batch, &mut last_checkpoint_id, cancel_rx.clone()).await;
    }

    finish(&ctx, &workflow, workflow_id, thread, &mut last_checkpoint_id).await;
}

/// A round: mark the batch `running`, run every step concurrently, then
/// fold results (completion, retry, or terminal failure) back in.
async fn run_round(
    workflow: &Arc<RwLock<Workflow>>,
    ctx: &Arc<SchedulerContext>,
    workflow_id: Uuid,
    thread: ThreadId,
    batch: &[String],
    last_checkpoint_id: &mut Option<i64>,
    cancel_rx: watch::Receiver<bool>,
) {
    for step_id in batch {
        if let Some(step) = workflow.write().step_mut(step_id) {
            step.status = StepStatus::Running;
        }
        ctx.event_bus.publish_workflow(WorkflowEvent::StepStarting { workflow_id, step_id: step_id.clone(), at: Utc::now() });
    }
    checkpoint(ctx, thread, workflow, last_checkpoint_id).await;

    let mut joins = JoinSet::new();
    for step_id in batch {
        let step_id = step_id.clone();
        let agent = {
            let wf = workflow.read();
            let step = wf.step(&step_id).expect("batch step exists");
            match ctx.agent_registry.build(&step.agent_type) {
                Ok(agent) => agent,
                Err(e) => {
                    joins.spawn(async move { (step_id, StepOutcome::Failed(e)) });
                    continue;
                }
            }
        };
        let input = prepare_step_input(workflow, &step_id, &ctx.principal, &ctx.shared_memory);
        ctx.event_bus.publish_workflow(WorkflowEvent::StepPrepared {
            workflow_id,
            step_id: step_id.clone(),
            at: Utc::now(),
        });
        ctx.event_bus.publish_workflow(WorkflowEvent::StepExecuting {
            workflow_id,
            step_id: step_id.clone(),
            at: Utc::now(),
        });

        let cancel_rx = cancel_rx.clone();
        let event_bus = ctx.event_bus.clone();
        joins.spawn(async move {
            let outcome = run_agent_with_cancellation(agent, input, cancel_rx, &event_bus, workflow_id, &step_id).await;
            (step_id, outcome)
        });
    }

    while let Some(joined) = joins.join_next().await {
        let (step_id, outcome) = match joined {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        apply_outcome(workflow, ctx, workflow_id, &step_id, outcome);
    }

    checkpoint(ctx, thread, workflow, last_checkpoint_id).await;
}

async fn run_agent_with_cancellation(
    agent: Arc<dyn Agent>,
    input: AgentNodeInput,
    mut cancel_rx: watch::Receiver<bool>,
    event_bus: &Arc<EventBus>,
    workflow_id: Uuid,
    step_id: &str,
) -> StepOutcome {
    let step_fut = agent.process(input);
    tokio::pin!(step_fut);
    let mut heartbeat = tokio::time::interval(STEP_HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            result = &mut step_fut => {
                return match result {
                    Ok(r) => StepOutcome::Completed(r),
                    Err(e) => StepOutcome::Failed(e),
                };
            }
            changed = cancel_rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                if *cancel_rx.borrow() {
                    return match tokio::time::timeout(CANCELLATION_GRACE, &mut step_fut).await {
                        Ok(Ok(r)) => StepOutcome::Completed(r),
                        Ok(Err(e)) => StepOutcome::Failed(e),
                        Err(_) => StepOutcome::Cancelled,
                    };
                }
            }
            _ = heartbeat.tick() => {
                event_bus.publish_workflow(WorkflowEvent::StepHeartbeat {
                    workflow_id,
                    step_id: step_id.to_string(),
                    at: Utc::now(),
                });
            }
        }
    }
}

fn prepare_step_input(workflow: &Arc<RwLock<Workflow>>, step_id: &str, principal: &Principal, shared_memory: &SharedMemoryStore) -> AgentNodeInput {
    let wf = workflow.read();
    let step = wf.step(step_id).expect("step exists");

    let mut step_input: HashMap<String, Value> = HashMap::new();
    step_input.insert("task_description".to_string(), Value::String(step.task_description.clone()));
    step_input.insert("query".to_string(), Value::String(wf.user_context.original_query.clone()));
    for (key, value) in &wf.user_context.extra {
        step_input.insert(key.clone(), value.clone());
    }

    // Handoff consumption (§4.5 step 2): ancestor data_outputs, namespaced
    // by the producing step's id.
    for dep_id in &step.depends_on {
        if let Some(dep) = wf.step(dep_id) {
            if let Some(result) = &dep.result {
                step_input.insert(format!("{dep_id}.response"), Value::String(result.response.clone()));
                for (key, value) in &result.data_outputs {
                    step_input.insert(format!("{dep_id}.{key}"), value.clone());
                }
            }
        }
    }

    let conversation_id = wf.user_context.conversation_id;
    let persona = wf.user_context.persona.clone();
    drop(wf);

    let shared_memory_snapshot = shared_memory.snapshot(principal, conversation_id).unwrap_or_default();
    let messages = shared_memory.messages(principal, conversation_id).unwrap_or_default();

    AgentNodeInput { step_input, shared_memory: shared_memory_snapshot, messages, persona }
}

fn apply_outcome(workflow: &Arc<RwLock<Workflow>>, ctx: &Arc<SchedulerContext>, workflow_id: Uuid, step_id: &str, outcome: StepOutcome) {
    let mut wf = workflow.write();
    let conversation_id = wf.user_context.conversation_id;
    let (from_agent_type, descendants) = {
        let step = wf.step(step_id).expect("step exists").clone();
        let descendants: Vec<(String, String)> = wf
            .steps
            .iter()
            .filter(|s| s.depends_on.contains(step_id))
            .map(|s| (s.step_id.clone(), s.agent_type.clone()))
            .collect();
        (step.agent_type.clone(), descendants)
    };

    match outcome {
        StepOutcome::Completed(result) => {
            let mut patch = HashMap::new();
            patch.insert(format!("{step_id}.response"), Value::String(result.response.clone()));
            for (key, value) in &result.data_outputs {
                patch.insert(format!("{step_id}.{key}"), value.clone());
            }
            drop(wf);
            if let Err(e) = ctx.shared_memory.merge(&ctx.principal, conversation_id, patch) {
                log::warn!("workflow {workflow_id} step {step_id}: writing data_outputs failed: {e}");
            }
            let mut wf = workflow.write();

            for (to_id, to_type) in &descendants {
                let handoff = DataHandoff {
                    handoff_id: Uuid::new_v4(),
                    handoff_type: determine_handoff_type(&from_agent_type, to_type),
                    from_agent: format!("{from_agent_type}_{step_id}"),
                    to_agent: format!("{to_type}_{to_id}"),
                    data_package: {
                        let mut package = HashMap::new();
                        package.insert("response".to_string(), Value::String(result.response.clone()));
                        package.insert("data_outputs".to_string(), serde_json::to_value(&result.data_outputs).unwrap_or(Value::Null));
                        package
                    },
                    processing_instructions: None,
                    created_at: Utc::now(),
                    size_bytes: result.response.len(),
                };
                wf.handoffs.push(handoff);
            }

            if let Some(step) = wf.step_mut(step_id) {
                step.status = StepStatus::Completed;
                step.result = Some(result);
            }
            drop(wf);
            ctx.event_bus.publish_workflow(WorkflowEvent::StepCompleted { workflow_id, step_id: step_id.to_string(), at: Utc::now() });
        }
        StepOutcome::Failed(e) => {
            let retryable = e.is_retryable();
            let should_retry = {
                let step = wf.step_mut(step_id).expect("step exists");
                if retryable && step.retry_count < step.max_retries {
                    step.retry_count += 1;
                    step.status = StepStatus::Pending;
                    step.retry_not_before = Some(Utc::now() + retry_backoff(step.retry_count));
                    true
                } else {
                    step.status = StepStatus::Failed;
                    step.failure_reason = Some(FailureReason::AgentError(e.to_string()));
                    false
                }
            };
            drop(wf);
            if !should_retry {
                ctx.event_bus.publish_workflow(WorkflowEvent::StepFailed {
                    workflow_id,
                    step_id: step_id.to_string(),
                    error: e.to_string(),
                    retryable,
                    at: Utc::now(),
                });
            }
        }
        StepOutcome::Cancelled => {
            if let Some(step) = wf.step_mut(step_id) {
                step.status = StepStatus::Cancelled;
            }
            drop(wf);
            ctx.event_bus.publish_workflow(WorkflowEvent::StepCancelled { workflow_id, step_id: step_id.to_string(), at: Utc::now() });
        }
    }
}

/// §4.5 deadlock guard: cascade pending steps whose dependency failed.
fn cascade_dependency_failures(wf: &mut Workflow, ctx: &Arc<SchedulerContext>, workflow_id: Uuid) {
    let failed = wf.failed_step_ids();
    for step in wf.steps.iter_mut() {
        if step.status == StepStatus::Pending && step.depends_on.iter().any(|d| failed.contains(d)) {
            step.status = StepStatus::Failed;
            step.failure_reason = Some(FailureReason::DependencyFailed);
            ctx.event_bus.publish_workflow(WorkflowEvent::StepFailed {
                workflow_id,
                step_id: step.step_id.clone(),
                error: "dependency_failed".to_string(),
                retryable: false,
                at: Utc::now(),
            });
        }
    }
}

fn cancel_remaining_steps(workflow: &Arc<RwLock<Workflow>>, ctx: &Arc<SchedulerContext>, workflow_id: Uuid) {
    let mut wf = workflow.write();
    wf.status = WorkflowStatus::Cancelled;
    for step in wf.steps.iter_mut() {
        if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
            step.status = StepStatus::Cancelled;
            ctx.event_bus.publish_workflow(WorkflowEvent::StepCancelled {
                workflow_id,
                step_id: step.step_id.clone(),
                at: Utc::now(),
            });
        }
    }
}

async fn checkpoint(ctx: &Arc<SchedulerContext>, thread: ThreadId, workflow: &Arc<RwLock<Workflow>>, last_checkpoint_id: &mut Option<i64>) {
    let state = serde_json::to_value(&*workflow.read()).unwrap_or(Value::Null);
    let store = ctx.checkpoint_store.clone();
    let parent = *last_checkpoint_id;
    let result = tokio::task::spawn_blocking(move || store.put(thread, state, parent)).await;
    match result {
        Ok(Ok(id)) => *last_checkpoint_id = Some(id),
        Ok(Err(e)) => log::warn!("workflow {}: checkpoint write failed: {e}", thread.workflow_id),
        Err(e) => log::warn!("workflow {}: checkpoint task panicked: {e}", thread.workflow_id),
    }
}

async fn finish(ctx: &Arc<SchedulerContext>, workflow: &Arc<RwLock<Workflow>>, workflow_id: Uuid, thread: ThreadId, last_checkpoint_id: &mut Option<i64>) {
    {
        let mut wf = workflow.write();
        if wf.status != WorkflowStatus::Cancelled {
            wf.status = if wf.has_failed_step() { WorkflowStatus::Failed } else { WorkflowStatus::Completed };
        }
        wf.completed_at = Some(Utc::now());
    }
    checkpoint(ctx, thread, workflow, last_checkpoint_id).await;

    let status = workflow.read().status;
    match status {
        WorkflowStatus::Completed => {
            ctx.event_bus.publish_workflow(WorkflowEvent::WorkflowCompleted { workflow_id, at: Utc::now() });
        }
        WorkflowStatus::Cancelled => {
            ctx.event_bus.publish_workflow(WorkflowEvent::WorkflowCancelled { workflow_id, at: Utc::now() });
        }
        WorkflowStatus::Failed => {
            let reason = workflow
                .read()
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Failed)
                .and_then(|s| s.failure_reason.clone())
                .map(|r| format!("{r:?}"))
                .unwrap_or_else(|| "unknown".to_string());
            ctx.event_bus.publish_workflow(WorkflowEvent::WorkflowError { workflow_id, reason, at: Utc::now() });
        }
        _ => {}
    }

    ctx.event_bus.retire_workflow(workflow_id);
}

fn determine_handoff_type(from_agent_type: &str, to_agent_type: &str) -> DataHandoffType {
    match (from_agent_type, to_agent_type) {
        ("research", "analysis") => DataHandoffType::ResearchToAnalysis,
        ("research", "coding") => DataHandoffType::ResearchToCoding,
        ("analysis", "coding") => DataHandoffType::AnalysisToCoding,
        ("coding", "validation") => DataHandoffType::CodingToValidation,
        ("research", "synthesis") => DataHandoffType::MultiResearchSynthesis,
        _ => DataHandoffType::IterativeRefinement,
    }
}

/// Small helper trait kept private to this module: marks a freshly built
/// workflow as `running` exactly once, returning a read guard's worth of
/// the fields the caller needs without holding the lock across an await.
trait StartOnce {
    fn write_then_read_started(&self) -> Workflow;
}

impl StartOnce for Arc<RwLock<Workflow>> {
    fn write_then_read_started(&self) -> Workflow {
        let mut wf = self.write();
        wf.status = WorkflowStatus::Running;
        wf.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_doubles_then_caps_at_30s() {
        assert_eq!(retry_backoff(1), chrono::Duration::seconds(4));
        assert_eq!(retry_backoff(2), chrono::Duration::seconds(8));
        assert_eq!(retry_backoff(3), chrono::Duration::seconds(16));
        assert_eq!(retry_backoff(4), chrono::Duration::seconds(30));
        assert_eq!(retry_backoff(10), chrono::Duration::seconds(30));
    }
}
