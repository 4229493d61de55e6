//! Typed events emitted by the Workflow Engine and by conversation-scoped
//! subsystems (messaging, edit proposals, agent status).
//!
//! `spec.md` §5 fixes the workflow event ordering guarantee: events for a
//! given step are emitted in the order listed on [`WorkflowEvent`]'s variants,
//! and a `step_starting` for a dependent step never precedes the
//! `step_completed` of its dependency. The event bus only has to preserve
//! send order per-channel to satisfy this; ordering itself is the scheduler's
//! responsibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Progress events streamed out of a running workflow (`subscribe_workflow_events`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_id: Uuid,
        template: Option<String>,
        at: DateTime<Utc>,
    },
    WorkflowPlanned {
        workflow_id: Uuid,
        total_steps: usize,
        at: DateTime<Utc>,
    },
    StepStarting {
        workflow_id: Uuid,
        step_id: String,
        at: DateTime<Utc>,
    },
    StepPrepared {
        workflow_id: Uuid,
        step_id: String,
        at: DateTime<Utc>,
    },
    StepExecuting {
        workflow_id: Uuid,
        step_id: String,
        at: DateTime<Utc>,
    },
    /// Emitted at least every 30s for a step still in flight (§5 liveness).
    StepHeartbeat {
        workflow_id: Uuid,
        step_id: String,
        at: DateTime<Utc>,
    },
    StepCompleted {
        workflow_id: Uuid,
        step_id: String,
        at: DateTime<Utc>,
    },
    StepFailed {
        workflow_id: Uuid,
        step_id: String,
        error: String,
        retryable: bool,
        at: DateTime<Utc>,
    },
    StepCancelled {
        workflow_id: Uuid,
        step_id: String,
        at: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
        at: DateTime<Utc>,
    },
    WorkflowError {
        workflow_id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    },
    WorkflowCancelled {
        workflow_id: Uuid,
        at: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> Uuid {
        match self {
            Self::WorkflowStarted { workflow_id, .. }
            | Self::WorkflowPlanned { workflow_id, .. }
            | Self::StepStarting { workflow_id, .. }
            | Self::StepPrepared { workflow_id, .. }
            | Self::StepExecuting { workflow_id, .. }
            | Self::StepHeartbeat { workflow_id, .. }
            | Self::StepCompleted { workflow_id, .. }
            | Self::StepFailed { workflow_id, .. }
            | Self::StepCancelled { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowError { workflow_id, .. }
            | Self::WorkflowCancelled { workflow_id, .. } => *workflow_id,
        }
    }
}

/// Conversation-scoped events (`subscribe_conversation`, §6): agent status
/// changes, chat messages, and edit-proposal lifecycle notices, all
/// multiplexed onto one stream per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    AgentStatus {
        conversation_id: Uuid,
        agent_type: String,
        status: String,
        at: DateTime<Utc>,
    },
    Message {
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        at: DateTime<Utc>,
    },
    EditProposalCreated {
        conversation_id: Uuid,
        proposal_id: Uuid,
        document_id: Uuid,
        at: DateTime<Utc>,
    },
}

impl ConversationEvent {
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::AgentStatus { conversation_id, .. }
            | Self::Message { conversation_id, .. }
            | Self::EditProposalCreated { conversation_id, .. } => *conversation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_event_carries_its_workflow_id() {
        let id = Uuid::new_v4();
        let ev = WorkflowEvent::WorkflowStarted {
            workflow_id: id,
            template: None,
            at: Utc::now(),
        };
        assert_eq!(ev.workflow_id(), id);
    }

    #[test]
    fn serializes_with_snake_case_tag() {
        let ev = WorkflowEvent::StepCompleted {
            workflow_id: Uuid::nil(),
            step_id: "research".into(),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "step_completed");
        assert_eq!(json["step_id"], "research");
    }
}
