//! Agent workspace management for ChatRelay.
#![allow(dead_code)]
//!
//! Each agent owns a working directory with identity/memory artifacts and a
//! generated teammate roster. Both operations here run before every
//! invocation, so they must be idempotent: identical inputs always leave
//! identical files on disk.

use std::collections::HashMap;
use std::path::Path;

use crate::config::{AgentConfig, TeamConfig};
use crate::core::routing::find_team_for_agent;
use crate::error::Error;

const TEAMMATES_FILE: &str = "TEAMMATES.md";

/// Idempotently create an agent's working directory and default artifacts.
pub fn ensure_agent_workspace(agent_dir: &Path, agent_id: &str) -> Result<(), Error> {
    std::fs::create_dir_all(agent_dir)?;

    let agent_md = agent_dir.join("AGENT.md");
    if !agent_md.exists() {
        std::fs::write(&agent_md, default_agent_md(agent_id))?;
        tracing::info!("Created default AGENT.md at {}", agent_md.display());
    }

    let memory_md = agent_dir.join("MEMORY.md");
    if !memory_md.exists() {
        std::fs::write(&memory_md, default_memory_md())?;
        tracing::info!("Created default MEMORY.md at {}", memory_md.display());
    }

    Ok(())
}

/// Rewrite the teammate roster from current sibling agents and teams.
///
/// Output is deterministic for identical inputs (sorted iteration), and the
/// file is only touched when its content would change.
pub fn update_teammates(
    agent_dir: &Path,
    agent_id: &str,
    agents: &HashMap<String, AgentConfig>,
    teams: &HashMap<String, TeamConfig>,
) -> Result<(), Error> {
    let content = render_teammates(agent_id, agents, teams);
    let path = agent_dir.join(TEAMMATES_FILE);

    let current = std::fs::read_to_string(&path).unwrap_or_default();
    if current == content {
        return Ok(());
    }

    std::fs::write(&path, content)?;
    tracing::debug!("Updated teammate roster at {}", path.display());
    Ok(())
}

fn render_teammates(
    agent_id: &str,
    agents: &HashMap<String, AgentConfig>,
    teams: &HashMap<String, TeamConfig>,
) -> String {
    let mut out = String::from("# Teammates\n\n");
    out.push_str("This file is generated from settings; edits will be overwritten.\n\n");

    if let Some((team_id, team)) = find_team_for_agent(agent_id, teams) {
        out.push_str(&format!("## Your team: {} ({})\n\n", team.name, team_id));
        if let Some(leader) = &team.leader_agent {
            out.push_str(&format!("Leader: @{}\n\n", leader));
        }

        let mut members = team.agents.clone();
        members.sort();
        for member in members.iter().filter(|m| m.as_str() != agent_id) {
            out.push_str(&describe_agent(member, agents));
        }
        out.push('\n');
    } else {
        out.push_str("You are not assigned to a team.\n\n");
    }

    out.push_str("## All agents\n\n");
    let mut ids: Vec<&String> = agents.keys().collect();
    ids.sort();
    for id in ids {
        if id == agent_id {
            out.push_str(&format!("- @{} (you)\n", id));
        } else {
            out.push_str(&describe_agent(id, agents));
        }
    }

    out
}

fn describe_agent(id: &str, agents: &HashMap<String, AgentConfig>) -> String {
    match agents.get(id) {
        Some(agent) => {
            let name = agent.name.as_deref().unwrap_or(id);
            let provider = agent.provider.as_deref().unwrap_or("openrouter");
            match agent.model.as_deref() {
                Some(model) => format!("- @{} — {} [{}/{}]\n", id, name, provider, model),
                None => format!("- @{} — {} [{}]\n", id, name, provider),
            }
        }
        None => format!("- @{}\n", id),
    }
}

fn default_agent_md(agent_id: &str) -> String {
    format!(
        r#"# Agent: {}

You are one agent in a multi-agent relay. Messages reach you through the
queue; your replies go back to the channel that sent them.

Keep replies concise and directly useful.
"#,
        agent_id
    )
}

fn default_memory_md() -> String {
    r#"# Memory

Track important context for your work here.

## Notes

- Add important decisions here
- Remember user preferences
"#
    .to_string()
}
