//! Background Pipelines (§4.8, component H): named recurring tasks sharing
//! the Workflow Engine's bounded-parallel, failure-isolated execution
//! shape but driven by a timer instead of a dependency graph.

mod checkpoint_gc;
mod feed;
mod presence;
mod scheduler;

pub use checkpoint_gc::CheckpointGc;
pub use feed::{Article, Feed, FeedEntry, FeedHttpClient, FeedParser, FeedPipeline, FeedRepository};
pub use presence::{PresenceReaper, PresenceRepository};
pub use scheduler::{run_round, spawn_periodic, BatchSummary};
