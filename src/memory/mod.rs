//! Shared Memory Store (component A): per-conversation message log and
//! freeform JSON memory map.

mod store;
mod types;

pub use store::SharedMemoryStore;
pub use types::{
    ActiveEditorSnapshot, Message, MessageRole, ReferencedDocument, APPEND_SEMANTICS_KEYS,
    KEY_ACTIVE_EDITOR, KEY_CONFIDENCE_LEVEL, KEY_REFERENCED_CONTEXT, KEY_SEARCH_HISTORY,
    KEY_SEARCH_RESULTS,
};
