//! Edit Resolver (component C) and Proposal Registry (component J).

pub mod proposal;
pub mod resolver;
mod types;

pub use proposal::{ApplyResult, ProposalRegistry, DIRECT_APPLY_ALLOW_LIST};
pub use resolver::{apply_resolved_edits, resolve, resolve_batch, ResolveBatch};
pub use types::{
    ContentEdit, ContentEditMode, DroppedOperation, EditProposal, EditType, EditorOperation,
    OpType, ResolvedEdit,
};
