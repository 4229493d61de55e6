//! Shared Memory Store (§4.1, component A): a process-wide map keyed by
//! `conversation_id`, each entry holding an append-only message log and a
//! freeform JSON-valued memory map agents read and patch as they run.
//!
//! Concurrency follows the teacher's dashmap + parking_lot idiom used
//! throughout the crate for shared, frequently-read process state: one
//! sharded map entry per conversation, an `RwLock` guarding that
//! conversation's mutable state so concurrent reads of one conversation see
//! a consistent snapshot while writes to it serialise, and no lock is ever
//! held across an await point or acquired for a second conversation while
//! held for the first (§5's lock-order rule stops at
//! `shared-memory-conversation`, the innermost level).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::principal::Principal;

use super::types::{Message, APPEND_SEMANTICS_KEYS};

struct ConversationEntry {
    owner: Uuid,
    messages: Vec<Message>,
    memory: HashMap<String, Value>,
}

/// The process-wide Shared Memory Store.
#[derive(Default)]
pub struct SharedMemoryStore {
    conversations: DashMap<Uuid, Arc<RwLock<ConversationEntry>>>,
}

impl SharedMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new conversation owned by `principal`, returning its id.
    pub fn create_conversation(&self, principal: &Principal) -> Uuid {
        let conversation_id = Uuid::new_v4();
        self.conversations.insert(
            conversation_id,
            Arc::new(RwLock::new(ConversationEntry {
                owner: principal.user_id,
                messages: Vec::new(),
                memory: HashMap::new(),
            })),
        );
        conversation_id
    }

    fn entry(&self, conversation_id: Uuid) -> CoreResult<Arc<RwLock<ConversationEntry>>> {
        self.conversations
            .get(&conversation_id)
            .map(|e| e.clone())
            .ok_or_else(|| CoreError::NotFound(format!("conversation {conversation_id}")))
    }

    fn authorize(principal: &Principal, entry: &ConversationEntry) -> CoreResult<()> {
        if principal.can_access(entry.owner) {
            Ok(())
        } else {
            Err(CoreError::AccessDenied(format!(
                "principal {} cannot access conversation owned by {}",
                principal.user_id, entry.owner
            )))
        }
    }

    pub fn get(&self, principal: &Principal, conversation_id: Uuid, key: &str) -> CoreResult<Option<Value>> {
        let entry = self.entry(conversation_id)?;
        let guard = entry.read();
        Self::authorize(principal, &guard)?;
        Ok(guard.memory.get(key).cloned())
    }

    pub fn put(&self, principal: &Principal, conversation_id: Uuid, key: &str, value: Value) -> CoreResult<()> {
        let entry = self.entry(conversation_id)?;
        let mut guard = entry.write();
        Self::authorize(principal, &guard)?;
        guard.memory.insert(key.to_string(), value);
        Ok(())
    }

    /// Shallow-merge `patch` into the conversation's memory. Lists are
    /// replaced wholesale unless their key is in
    /// [`APPEND_SEMANTICS_KEYS`](super::types::APPEND_SEMANTICS_KEYS), in
    /// which case the incoming list is appended to whatever list (if any)
    /// is already stored under that key.
    pub fn merge(&self, principal: &Principal, conversation_id: Uuid, patch: HashMap<String, Value>) -> CoreResult<()> {
        let entry = self.entry(conversation_id)?;
        let mut guard = entry.write();
        Self::authorize(principal, &guard)?;

        for (key, incoming) in patch {
            if APPEND_SEMANTICS_KEYS.contains(&key.as_str()) {
                if let Value::Array(mut incoming_items) = incoming {
                    match guard.memory.get_mut(&key) {
                        Some(Value::Array(existing)) => existing.append(&mut incoming_items),
                        _ => {
                            guard.memory.insert(key, Value::Array(incoming_items));
                        }
                    }
                } else {
                    guard.memory.insert(key, incoming);
                }
            } else {
                guard.memory.insert(key, incoming);
            }
        }
        Ok(())
    }

    pub fn delete(&self, principal: &Principal, conversation_id: Uuid, key: &str) -> CoreResult<()> {
        let entry = self.entry(conversation_id)?;
        let mut guard = entry.write();
        Self::authorize(principal, &guard)?;
        guard.memory.remove(key);
        Ok(())
    }

    /// An immutable point-in-time copy of the whole memory map.
    pub fn snapshot(&self, principal: &Principal, conversation_id: Uuid) -> CoreResult<HashMap<String, Value>> {
        let entry = self.entry(conversation_id)?;
        let guard = entry.read();
        Self::authorize(principal, &guard)?;
        Ok(guard.memory.clone())
    }

    /// Append a message to the conversation's log (I5: append-only).
    pub fn append_message(&self, principal: &Principal, conversation_id: Uuid, message: Message) -> CoreResult<()> {
        let entry = self.entry(conversation_id)?;
        let mut guard = entry.write();
        Self::authorize(principal, &guard)?;
        guard.messages.push(message);
        Ok(())
    }

    /// Tombstone a message without reordering or removing it (I5).
    pub fn tombstone_message(&self, principal: &Principal, conversation_id: Uuid, message_id: Uuid) -> CoreResult<()> {
        let entry = self.entry(conversation_id)?;
        let mut guard = entry.write();
        Self::authorize(principal, &guard)?;
        let message = guard
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id)
            .ok_or_else(|| CoreError::NotFound(format!("message {message_id}")))?;
        message.tombstoned = true;
        Ok(())
    }

    pub fn messages(&self, principal: &Principal, conversation_id: Uuid) -> CoreResult<Vec<Message>> {
        let entry = self.entry(conversation_id)?;
        let guard = entry.read();
        Self::authorize(principal, &guard)?;
        Ok(guard.messages.clone())
    }

    /// Explicitly destroy a conversation and everything it holds.
    pub fn destroy_conversation(&self, principal: &Principal, conversation_id: Uuid) -> CoreResult<()> {
        let entry = self.entry(conversation_id)?;
        {
            let guard = entry.read();
            Self::authorize(principal, &guard)?;
        }
        self.conversations.remove(&conversation_id);
        Ok(())
    }

    /// Mark an instant of write activity for callers doing their own
    /// liveness bookkeeping (background pipelines use this to know a
    /// conversation is still active). No-op against stored data.
    pub fn touch(&self, conversation_id: Uuid) -> CoreResult<()> {
        self.entry(conversation_id).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::Role;
    use serde_json::json;

    fn user(id: Uuid) -> Principal {
        Principal::new(id, Role::User)
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = SharedMemoryStore::new();
        let owner = user(Uuid::new_v4());
        let conv = store.create_conversation(&owner);

        store.put(&owner, conv, "confidence_level", json!(0.8)).unwrap();
        assert_eq!(store.get(&owner, conv, "confidence_level").unwrap(), Some(json!(0.8)));
    }

    #[test]
    fn unknown_conversation_is_not_found() {
        let store = SharedMemoryStore::new();
        let owner = user(Uuid::new_v4());
        let err = store.get(&owner, Uuid::new_v4(), "x").unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn non_owner_is_access_denied() {
        let store = SharedMemoryStore::new();
        let owner = user(Uuid::new_v4());
        let conv = store.create_conversation(&owner);
        let stranger = user(Uuid::new_v4());
        let err = store.get(&stranger, conv, "x").unwrap_err();
        assert!(matches!(err, CoreError::AccessDenied(_)));
    }

    #[test]
    fn admin_bypasses_ownership_check() {
        let store = SharedMemoryStore::new();
        let owner = user(Uuid::new_v4());
        let conv = store.create_conversation(&owner);
        let admin = Principal::new(Uuid::new_v4(), Role::Admin);
        assert!(store.get(&admin, conv, "x").is_ok());
    }

    #[test]
    fn merge_appends_allow_listed_keys() {
        let store = SharedMemoryStore::new();
        let owner = user(Uuid::new_v4());
        let conv = store.create_conversation(&owner);

        store
            .put(&owner, conv, "search_history", json!(["first query"]))
            .unwrap();

        let mut patch = HashMap::new();
        patch.insert("search_history".to_string(), json!(["second query"]));
        store.merge(&owner, conv, patch).unwrap();

        let history = store.get(&owner, conv, "search_history").unwrap().unwrap();
        assert_eq!(history, json!(["first query", "second query"]));
    }

    #[test]
    fn merge_replaces_non_allow_listed_list_keys() {
        let store = SharedMemoryStore::new();
        let owner = user(Uuid::new_v4());
        let conv = store.create_conversation(&owner);

        store
            .put(&owner, conv, "referenced_context", json!({"docs": ["a"]}))
            .unwrap();

        let mut patch = HashMap::new();
        patch.insert("referenced_context".to_string(), json!({"docs": ["b"]}));
        store.merge(&owner, conv, patch).unwrap();

        assert_eq!(
            store.get(&owner, conv, "referenced_context").unwrap().unwrap(),
            json!({"docs": ["b"]})
        );
    }

    #[test]
    fn tombstoning_a_message_does_not_reorder_the_log() {
        let store = SharedMemoryStore::new();
        let owner = user(Uuid::new_v4());
        let conv = store.create_conversation(&owner);

        let m1 = Message::new(crate::memory::types::MessageRole::Human, "hi");
        let m2 = Message::new(crate::memory::types::MessageRole::Ai, "hello");
        let m1_id = m1.message_id;
        store.append_message(&owner, conv, m1).unwrap();
        store.append_message(&owner, conv, m2).unwrap();

        store.tombstone_message(&owner, conv, m1_id).unwrap();

        let messages = store.messages(&owner, conv).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].tombstoned);
        assert!(!messages[1].tombstoned);
    }
}
