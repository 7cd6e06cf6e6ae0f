//! Configuration loading for ChatRelay.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the ChatRelay home directory (~/.chatrelay).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".chatrelay"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.chatrelay/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}. Create it before starting the daemon.",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.agents.is_empty() {
        return Err(Error::Config(
            "No agents configured in settings.agents".to_string(),
        ));
    }

    if let Some(default_agent) = settings.routing.default_agent.as_deref() {
        if !settings.agents.contains_key(default_agent) {
            return Err(Error::Config(format!(
                "routing.default_agent '{}' not found in settings.agents",
                default_agent
            )));
        }
    }

    for (team_id, team) in &settings.teams {
        for agent_id in &team.agents {
            if !settings.agents.contains_key(agent_id) {
                return Err(Error::Config(format!(
                    "team '{}' references unknown agent '{}'",
                    team_id, agent_id
                )));
            }
        }
    }

    Ok(())
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Workspace configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Workspace {
    pub path: Option<PathBuf>,
    pub name: Option<String>,
}

/// Channels configuration.
///
/// Connectors are external processes; the daemon only needs to know which
/// channel names are allowed to appear on inbound records.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Channels {
    pub enabled: Vec<String>,
}

/// Agent configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AgentConfig {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub working_directory: Option<PathBuf>,
}

/// Team configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TeamConfig {
    pub name: String,
    pub agents: Vec<String>,
    pub leader_agent: Option<String>,
}

/// Provider model configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ProviderModel {
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub cli_path: Option<String>,
}

/// Models configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Models {
    #[serde(default)]
    pub openrouter: ProviderModel,
    #[serde(default)]
    pub claude: ProviderModel,
}

/// Routing configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Routing {
    pub default_agent: Option<String>,
}

/// Queue configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct QueueSettings {
    /// Queue root directory; defaults to <home>/queue.
    pub root: Option<PathBuf>,

    /// Poll interval for the dispatch loop, in seconds.
    pub poll_interval_secs: Option<u64>,
}

/// Outbound file sandbox configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct FilesSettings {
    /// Sandbox root for [send_file: ...] directives; defaults to <home>/files.
    pub root: Option<PathBuf>,
}

/// ChatRelay settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub workspace: Workspace,

    #[serde(default)]
    pub channels: Channels,

    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,

    #[serde(default)]
    pub teams: HashMap<String, TeamConfig>,

    #[serde(default)]
    pub models: Models,

    #[serde(default)]
    pub routing: Routing,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub files: FilesSettings,
}

impl Settings {
    /// Resolve the queue root directory.
    pub fn queue_root(&self) -> Result<PathBuf> {
        match &self.queue.root {
            Some(root) => Ok(root.clone()),
            None => Ok(get_home_dir()?.join("queue")),
        }
    }

    /// Resolve the sandbox root for outbound file directives.
    pub fn files_root(&self) -> Result<PathBuf> {
        match &self.files.root {
            Some(root) => Ok(root.clone()),
            None => Ok(get_home_dir()?.join("files")),
        }
    }

    /// Resolve the working directory for an agent.
    ///
    /// Priority: explicit per-agent directory, then <workspace>/<agent_id>,
    /// then <home>/agents/<agent_id>.
    pub fn agent_dir(&self, agent_id: &str) -> Result<PathBuf> {
        if let Some(agent) = self.agents.get(agent_id) {
            if let Some(dir) = &agent.working_directory {
                return Ok(dir.clone());
            }
        }

        if let Some(workspace) = &self.workspace.path {
            return Ok(workspace.join(agent_id));
        }

        Ok(get_home_dir()?.join("agents").join(agent_id))
    }

    pub fn poll_interval_secs(&self) -> u64 {
        self.queue.poll_interval_secs.unwrap_or(1)
    }
}
