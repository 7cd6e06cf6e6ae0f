//! Per-agent conversation history for ChatRelay.
#![allow(dead_code)]
//!
//! Gives HTTP providers multi-turn continuity while bounding memory growth.
//! Histories live for the daemon's lifetime only; a restart starts every
//! agent from an empty window.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Maximum turns retained per agent.
pub const MAX_HISTORY_MESSAGES: usize = 40;

/// Conversation turn role.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message exchanged in a dialogue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Bounded per-agent conversation store.
///
/// The outer map lock is held only long enough to fetch or create an agent's
/// handle; mutation takes the per-agent lock, so concurrent dispatch of two
/// different agents never contends on history access.
pub struct ConversationStore {
    cap: usize,
    agents: Mutex<HashMap<String, Arc<Mutex<Vec<Turn>>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::with_cap(MAX_HISTORY_MESSAGES)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or create the history handle for an agent.
    fn handle(&self, agent_id: &str) -> Arc<Mutex<Vec<Turn>>> {
        let mut agents = lock(&self.agents);
        agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Append a turn, evicting oldest turns while over the cap.
    ///
    /// The turn just appended is never evicted, even with a cap of 1.
    pub fn append(&self, agent_id: &str, turn: Turn) {
        let handle = self.handle(agent_id);
        let mut turns = lock(&handle);
        turns.push(turn);
        while turns.len() > self.cap {
            turns.remove(0);
        }
    }

    /// Replace an agent's history with an empty sequence.
    pub fn reset(&self, agent_id: &str) {
        let handle = self.handle(agent_id);
        lock(&handle).clear();
    }

    /// Clone the current turns for an agent.
    ///
    /// Unknown agents yield an empty sequence, not an error.
    pub fn snapshot(&self, agent_id: &str) -> Vec<Turn> {
        let maybe = lock(&self.agents).get(agent_id).cloned();
        match maybe {
            Some(handle) => lock(&handle).clone(),
            None => Vec::new(),
        }
    }

    /// Number of turns currently held for an agent.
    pub fn len(&self, agent_id: &str) -> usize {
        let maybe = lock(&self.agents).get(agent_id).cloned();
        match maybe {
            Some(handle) => lock(&handle).len(),
            None => 0,
        }
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
