//! In-process event bus used to fan out [`WorkflowEvent`]s and
//! [`ConversationEvent`]s to subscribers.
//!
//! The teacher crate's `CrewAIEventsBus` is a global singleton dispatching
//! type-erased events to registered handlers with dependency ordering. This
//! core has a narrower job: every consumer wants an ordered stream scoped to
//! one workflow or one conversation (`subscribe_workflow_events`,
//! `subscribe_conversation`, §6), so channels are keyed by id rather than by
//! event type, and delivery is a `tokio::sync::broadcast` send rather than a
//! handler-dependency graph. Per-channel send order is preserved, which is
//! all the ordering guarantee in §5 requires of the bus itself.

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::types::{ConversationEvent, WorkflowEvent};

const CHANNEL_CAPACITY: usize = 256;

/// Registers an event, used for both the dispatch log and local debugging.
/// Mirrors the teacher's `HandlerId`: a stable, monotonically assigned
/// identifier, here attached to a subscription rather than a handler.
static SUBSCRIPTION_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn next_subscription_id() -> u64 {
    SUBSCRIPTION_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// A live subscription to one workflow's or one conversation's event stream.
pub struct Subscription<T> {
    pub id: u64,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Wait for the next event. Returns `None` once the publishing side has
    /// dropped (the workflow/conversation channel was torn down) and no
    /// further events will arrive; a subscriber that falls behind the
    /// channel's ring buffer observes a gap, logged and skipped rather than
    /// treated as a fatal error.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("subscription {} lagged, skipped {} events", self.id, skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Owns the broadcast channels backing workflow- and conversation-scoped
/// event streams. One `EventBus` is shared across the whole process.
#[derive(Default)]
pub struct EventBus {
    workflow_channels: DashMap<Uuid, broadcast::Sender<WorkflowEvent>>,
    conversation_channels: DashMap<Uuid, broadcast::Sender<ConversationEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a workflow event, lazily creating the channel on first use.
    /// A publish with no subscribers is a no-op, not an error — the engine
    /// emits events regardless of whether anyone is listening.
    pub fn publish_workflow(&self, event: WorkflowEvent) {
        let workflow_id = event.workflow_id();
        let sender = self
            .workflow_channels
            .entry(workflow_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let _ = sender.send(event);
    }

    pub fn subscribe_workflow(&self, workflow_id: Uuid) -> Subscription<WorkflowEvent> {
        let sender = self
            .workflow_channels
            .entry(workflow_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        Subscription {
            id: next_subscription_id(),
            receiver: sender.subscribe(),
        }
    }

    /// Drop the channel for a workflow that has reached a terminal state.
    /// Live subscribers keep whatever receiver they already hold; new
    /// subscribers after this point get a fresh, empty channel.
    pub fn retire_workflow(&self, workflow_id: Uuid) {
        self.workflow_channels.remove(&workflow_id);
    }

    pub fn publish_conversation(&self, event: ConversationEvent) {
        let conversation_id = event.conversation_id();
        let sender = self
            .conversation_channels
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let _ = sender.send(event);
    }

    pub fn subscribe_conversation(&self, conversation_id: Uuid) -> Subscription<ConversationEvent> {
        let sender = self
            .conversation_channels
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        Subscription {
            id: next_subscription_id(),
            receiver: sender.subscribe(),
        }
    }
}
