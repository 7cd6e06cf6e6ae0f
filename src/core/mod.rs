//! Core pipeline: queue state machine, conversation store, routing,
//! directives, and the dispatch loop.

pub mod directives;
pub mod dispatch;
pub mod history;
pub mod queue;
pub mod routing;

pub use dispatch::Dispatcher;
pub use history::{ConversationStore, Role, Turn, MAX_HISTORY_MESSAGES};
pub use queue::{
    FailureRecord, MessageData, Queue, QueueRecord, QueueState, QueueStats, ResponseRecord,
};
