//! Message routing for ChatRelay.
#![allow(dead_code)]
//!
//! Handles:
//! - Agent routing (@agent_id prefix)
//! - Default-agent fallback
//! - Team lookup for the teammate roster

use regex::Regex;
use std::collections::HashMap;

use crate::config::{Settings, TeamConfig};
use crate::core::queue::QueueRecord;
use crate::error::Error;

/// Parse agent routing from message prefix.
///
/// Returns the agent ID if the message starts with `@agent_id `.
pub fn parse_agent_routing(message: &str) -> Option<(String, String)> {
    let re = Regex::new(r"^@(\w+)\s+(.+)$").ok()?;

    let caps = re.captures(message.trim_start())?;
    let agent_id = caps.get(1)?.as_str().to_lowercase();
    let remaining = caps.get(2)?.as_str();

    Some((agent_id, remaining.to_string()))
}

/// Get the default agent from settings.
pub fn default_agent(settings: &Settings) -> Option<String> {
    if let Some(id) = settings.routing.default_agent.as_deref() {
        if settings.agents.contains_key(id) {
            return Some(id.to_string());
        }
    }

    if settings.agents.contains_key("default") {
        return Some("default".to_string());
    }

    // Stable fallback.
    let mut ids: Vec<String> = settings.agents.keys().cloned().collect();
    ids.sort();
    ids.into_iter().next()
}

/// Resolve the target agent and the message body an inbound record carries.
///
/// Priority: a valid pre-routed `agent` field, then an `@agent_id ` body
/// prefix, then the default agent with the body unchanged.
pub fn resolve_agent(record: &QueueRecord, settings: &Settings) -> Result<(String, String), Error> {
    if let Some(pre_routed) = &record.agent {
        if settings.agents.contains_key(pre_routed) {
            return Ok((pre_routed.clone(), record.data.body.clone()));
        }
        tracing::warn!(
            "Record {} pre-routed to unknown agent '{}', falling back",
            record.id,
            pre_routed
        );
    }

    if let Some((agent_id, remaining)) = parse_agent_routing(&record.data.body) {
        if settings.agents.contains_key(&agent_id) {
            return Ok((agent_id, remaining));
        }
    }

    let fallback = default_agent(settings)
        .ok_or_else(|| Error::Config("No agents configured".to_string()))?;
    Ok((fallback, record.data.body.clone()))
}

/// Find the first team that contains an agent.
pub fn find_team_for_agent(
    agent_id: &str,
    teams: &HashMap<String, TeamConfig>,
) -> Option<(String, TeamConfig)> {
    let mut team_ids: Vec<&String> = teams.keys().collect();
    team_ids.sort();

    for team_id in team_ids {
        let team = &teams[team_id];
        if team.agents.iter().any(|a| a == agent_id) {
            return Some((team_id.clone(), team.clone()));
        }
    }
    None
}
