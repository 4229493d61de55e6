//! Edit Resolver / Proposal Registry data model (`spec.md` §3: `EditorOperation`,
//! `EditProposal`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    ReplaceRange,
    DeleteRange,
    InsertAfterHeading,
    InsertAfter,
}

/// An agent-emitted edit instruction, not yet anchored to concrete offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorOperation {
    pub op_type: OpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Verbatim 20-40 words the agent expects to find at `[start, end)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
    /// Heading text to search for, used by `insert_after_heading`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_text: Option<String>,
    #[serde(default)]
    pub occurrence_index: usize,
    pub confidence: f64,
}

/// The result of resolving one `EditorOperation` against a document body:
/// concrete offsets ready to splice in `text`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEdit {
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub confidence: f64,
}

/// An operation the resolver could not place onto the document. Non-fatal
/// per §4.3/§7 — logged, the rest of the batch still proceeds.
#[derive(Debug, Clone)]
pub struct DroppedOperation {
    pub operation: EditorOperation,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditType {
    Operations,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentEditMode {
    Append,
    Replace,
    InsertAt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentEdit {
    pub mode: ContentEditMode,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_position: Option<usize>,
}

/// A reviewable proposal to change a document: either a batch of
/// `EditorOperation`s or a whole-content edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditProposal {
    pub proposal_id: Uuid,
    pub document_id: Uuid,
    pub edit_type: EditType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<EditorOperation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_edit: Option<ContentEdit>,
    pub agent_name: String,
    pub summary: String,
    pub requires_preview: bool,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

impl EditProposal {
    pub fn new_operations(
        document_id: Uuid,
        operations: Vec<EditorOperation>,
        agent_name: impl Into<String>,
        summary: impl Into<String>,
        user_id: Uuid,
        requires_preview: bool,
    ) -> Self {
        Self {
            proposal_id: Uuid::new_v4(),
            document_id,
            edit_type: EditType::Operations,
            operations: Some(operations),
            content_edit: None,
            agent_name: agent_name.into(),
            summary: summary.into(),
            requires_preview,
            user_id,
            created_at: Utc::now(),
            applied: false,
            applied_at: None,
        }
    }

    pub fn is_expired(&self, expiry: chrono::Duration) -> bool {
        !self.applied && Utc::now() - self.created_at > expiry
    }
}
