//! Workflow data model (`spec.md` §3): `Workflow`, `Step`, `DataHandoff`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agents::AgentResult;
use crate::principal::Principal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Why a step ended up `failed`, carried alongside the status for the
/// per-step summary a caller sees on workflow failure (§7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    AgentError(String),
    Timeout,
    DependencyFailed,
    SchedulerOverflow,
}

/// A snapshot of the principal, original query and persona a workflow was
/// started with — immutable for the workflow's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub principal: Principal,
    pub conversation_id: Uuid,
    pub original_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub agent_type: String,
    pub task_description: String,
    pub input_requirements: Vec<String>,
    pub output_specifications: Vec<String>,
    pub depends_on: HashSet<String>,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    /// Set when a retryable failure requeues this step (§4.5 exponential
    /// backoff, base 2s cap 30s); the step is not ready until this passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_not_before: Option<DateTime<Utc>>,
}

impl Step {
    pub fn is_ready(&self, completed: &HashSet<String>, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Pending
            && self.depends_on.iter().all(|d| completed.contains(d))
            && self.retry_not_before.is_none_or(|t| now >= t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataHandoffType {
    ResearchToAnalysis,
    AnalysisToCoding,
    ResearchToCoding,
    CodingToValidation,
    MultiResearchSynthesis,
    IterativeRefinement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataHandoff {
    pub handoff_id: Uuid,
    pub handoff_type: DataHandoffType,
    pub from_agent: String,
    pub to_agent: String,
    pub data_package: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_instructions: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Uuid,
    /// `None` for a caller-submitted dynamic plan (§4.5).
    pub template_name: Option<String>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub user_context: UserContext,
    pub steps: Vec<Step>,
    pub max_parallel: usize,
    #[serde(default)]
    pub handoffs: Vec<DataHandoff>,
}

impl Workflow {
    pub fn completed_step_ids(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.step_id.clone())
            .collect()
    }

    pub fn failed_step_ids(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.step_id.clone())
            .collect()
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// `R = {s | pending ∧ all deps completed ∧ backoff elapsed}` (§4.5).
    pub fn ready_steps(&self, now: DateTime<Utc>) -> Vec<String> {
        let completed = self.completed_step_ids();
        self.steps.iter().filter(|s| s.is_ready(&completed, now)).map(|s| s.step_id.clone()).collect()
    }

    /// True iff every step is terminal (completed, failed, or cancelled)
    /// and at least one completed (I3).
    pub fn is_terminal(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled))
    }

    pub fn has_failed_step(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str) -> Step {
        Step {
            step_id: id.to_string(),
            agent_type: "research".to_string(),
            task_description: "x".into(),
            input_requirements: vec![],
            output_specifications: vec![],
            depends_on: HashSet::new(),
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: 2,
            result: None,
            failure_reason: None,
            retry_not_before: None,
        }
    }

    #[test]
    fn step_sitting_out_backoff_is_not_ready() {
        let mut s = step("a");
        s.retry_not_before = Some(Utc::now() + chrono::Duration::seconds(10));
        assert!(!s.is_ready(&HashSet::new(), Utc::now()));
    }

    #[test]
    fn step_past_its_backoff_is_ready() {
        let mut s = step("a");
        s.retry_not_before = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(s.is_ready(&HashSet::new(), Utc::now()));
    }
}

/// A caller-submitted step in a dynamic plan (§4.5), before it is attached
/// to a concrete `Workflow` instance. Distinct from [`Step`]: a caller never
/// supplies `status`/`retry_count`/`result` themselves.
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    pub step_id: String,
    pub agent_type: String,
    pub task_description: String,
    #[serde(default)]
    pub input_requirements: Vec<String>,
    #[serde(default)]
    pub output_specifications: Vec<String>,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    pub max_retries: Option<u32>,
}

/// Status summary returned by `get_workflow_status` (§6).
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusSummary {
    pub status: WorkflowStatus,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub failed_steps: usize,
    pub current_step: Option<String>,
    pub execution_time_secs: f64,
}
