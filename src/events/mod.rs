//! Typed events and the in-process bus that fans them out to subscribers.

mod bus;
mod types;

pub use bus::{EventBus, Subscription};
pub use types::{ConversationEvent, WorkflowEvent};
