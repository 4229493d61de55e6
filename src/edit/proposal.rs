//! Proposal Registry (§4.3/I6, component J): holds [`EditProposal`]s between
//! creation and application, enforcing "apply once" idempotence, plus a
//! narrow allow-listed path (`apply_operations_directly` in
//! `document_editing_tools.py`) letting a small set of trusted agent types
//! skip the review step for documents they are explicitly scoped to.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

use super::types::EditProposal;

/// Agent types permitted to apply operations directly to a document they
/// are explicitly scoped to, bypassing the propose→review→apply flow.
/// Mirrors the original's allow-list gate on `apply_operations_directly`,
/// not a general bypass of proposal review.
pub const DIRECT_APPLY_ALLOW_LIST: &[&str] = &["proofreading_agent", "continuity_agent"];

pub fn agent_may_apply_directly(agent_type: &str) -> bool {
    DIRECT_APPLY_ALLOW_LIST.contains(&agent_type)
}

/// The outcome of a successful `apply`.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub proposal_id: Uuid,
    /// `true` the first time this proposal was applied; `false` when the
    /// caller's apply call was a no-op replay of an already-applied
    /// proposal (I6: idempotent reapply returns the prior result).
    pub newly_applied: bool,
}

/// In-memory registry of live edit proposals, keyed by `proposal_id`. One
/// `parking_lot::Mutex` per entry gives the compare-and-set semantics I6
/// requires (`applied` false→true is atomic) without taking a registry-wide
/// lock for unrelated proposals, matching the per-key locking granularity
/// used elsewhere in the core (shared memory, checkpoints).
#[derive(Default)]
pub struct ProposalRegistry {
    proposals: DashMap<Uuid, Arc<Mutex<EditProposal>>>,
}

impl ProposalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, proposal: EditProposal) -> Uuid {
        let id = proposal.proposal_id;
        self.proposals.insert(id, Arc::new(Mutex::new(proposal)));
        id
    }

    pub fn get(&self, proposal_id: Uuid) -> CoreResult<EditProposal> {
        self.proposals
            .get(&proposal_id)
            .map(|entry| entry.lock().clone())
            .ok_or_else(|| CoreError::NotFound(format!("edit proposal {proposal_id}")))
    }

    /// Apply a proposal. Re-applying an already-applied proposal is a no-op
    /// that returns the prior result rather than erroring (I6).
    pub fn apply(&self, proposal_id: Uuid) -> CoreResult<ApplyResult> {
        let entry = self
            .proposals
            .get(&proposal_id)
            .ok_or_else(|| CoreError::NotFound(format!("edit proposal {proposal_id}")))?;
        let mut guard = entry.lock();

        if guard.applied {
            return Ok(ApplyResult { proposal_id, newly_applied: false });
        }

        guard.applied = true;
        guard.applied_at = Some(Utc::now());
        Ok(ApplyResult { proposal_id, newly_applied: true })
    }

    /// Expire (remove) proposals older than `expiry` that were never
    /// applied (§3: "Proposal lifetime: ... either applied ... or
    /// expired").
    pub fn expire_stale(&self, expiry: chrono::Duration) -> usize {
        let stale: Vec<Uuid> = self
            .proposals
            .iter()
            .filter(|entry| entry.value().lock().is_expired(expiry))
            .map(|entry| *entry.key())
            .collect();

        for id in &stale {
            self.proposals.remove(id);
        }
        stale.len()
    }

    /// Validate that `agent_type` is allowed to bypass review for
    /// `document_id`; callers are expected to also check the agent's
    /// workflow step was actually scoped to that document before calling
    /// this — the allow-list only narrows *which agent types* qualify, not
    /// *which documents* a given instance may touch.
    pub fn check_direct_apply_allowed(&self, agent_type: &str) -> CoreResult<()> {
        if agent_may_apply_directly(agent_type) {
            Ok(())
        } else {
            Err(CoreError::AccessDenied(format!(
                "agent type {agent_type} is not on the direct-apply allow-list"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::types::{EditType, OpType};
    use crate::edit::EditorOperation;

    fn proposal() -> EditProposal {
        EditProposal::new_operations(
            Uuid::new_v4(),
            vec![EditorOperation {
                op_type: OpType::ReplaceRange,
                start: Some(0),
                end: Some(5),
                text: Some("hi".into()),
                original_text: Some("hello".into()),
                anchor_text: None,
                occurrence_index: 0,
                confidence: 1.0,
            }],
            "writer_agent",
            "swap greeting",
            Uuid::new_v4(),
            true,
        )
    }

    #[test]
    fn apply_marks_proposal_applied_exactly_once() {
        let registry = ProposalRegistry::new();
        let id = registry.create(proposal());

        let first = registry.apply(id).unwrap();
        assert!(first.newly_applied);

        let second = registry.apply(id).unwrap();
        assert!(!second.newly_applied);

        let stored = registry.get(id).unwrap();
        assert!(stored.applied);
        assert!(stored.applied_at.is_some());
    }

    #[test]
    fn applying_unknown_proposal_is_not_found() {
        let registry = ProposalRegistry::new();
        assert!(matches!(registry.apply(Uuid::new_v4()), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn direct_apply_allow_list_rejects_unknown_agent_types() {
        let registry = ProposalRegistry::new();
        assert!(registry.check_direct_apply_allowed("proofreading_agent").is_ok());
        assert!(registry.check_direct_apply_allowed("random_agent").is_err());
    }

    #[test]
    fn edit_type_operations_round_trips() {
        let p = proposal();
        assert_eq!(p.edit_type, EditType::Operations);
        assert!(!p.applied);
    }
}
