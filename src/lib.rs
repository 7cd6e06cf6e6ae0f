//! ChatRelay library root.

pub mod agent;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod providers;
pub mod workspace;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{ConversationStore, Dispatcher, MessageData, Queue, QueueRecord};
pub use error::{Error, Result};
pub use providers::{Invoker, ProviderError};
