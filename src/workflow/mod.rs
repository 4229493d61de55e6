//! Workflow Engine (§4.5, component E): template and dynamic DAG workflows,
//! scheduled with bounded parallelism over the Agent Registry, checkpointed
//! at every state transition, and streamed out as typed events.

mod engine;
mod scheduler;
mod templates;
mod types;

pub use engine::WorkflowEngine;
pub use templates::{StepTemplate, TemplateRegistry, WorkflowTemplate, PARALLEL_RESEARCH_SYNTHESIS, RESEARCH_ANALYSIS_SYNTHESIS, RESEARCH_CODING_IMPLEMENTATION};
pub use types::{
    DataHandoff, DataHandoffType, FailureReason, Step, StepSpec, StepStatus, UserContext, Workflow, WorkflowStatus, WorkflowStatusSummary,
};
