//! CLI subprocess provider (legacy path).
#![allow(dead_code)]
//!
//! Spawns an external agent CLI and extracts the reply from its
//! line-delimited JSON output. The CLI keeps its own session state, so
//! continuity is a resume flag rather than a replayed history.

use std::process::Stdio;
use tokio::process::Command;

use super::{InvokeRequest, ProviderError, Result};
use crate::config::Settings;

const DEFAULT_CLI_PATH: &str = "claude";

/// Returned when the CLI exits cleanly but emits no completed message.
/// Deliberately lenient where the HTTP path is strict: the channel always
/// receives something on this transport.
const FALLBACK_REPLY: &str = "No response generated.";

#[derive(Debug)]
pub struct SubprocessInvoker {
    cli_path: String,
}

impl SubprocessInvoker {
    pub fn new() -> Self {
        Self {
            cli_path: DEFAULT_CLI_PATH.to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        match &settings.models.claude.cli_path {
            Some(path) => Self::with_cli_path(path.clone()),
            None => Self::new(),
        }
    }

    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    /// Spawn the CLI and extract the reply from its stream-JSON output.
    pub async fn invoke(&self, req: &InvokeRequest<'_>) -> Result<String> {
        let mut cmd = Command::new(&self.cli_path);

        // Resume the prior session unless this message opens a fresh window.
        if !req.reset {
            cmd.arg("-c");
        }

        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");

        if let Some(model) = selected_model_arg(req.model) {
            cmd.arg("--model").arg(model);
        }

        cmd.arg(req.message);

        if let Some(dir) = req.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            "Spawning {} for agent {} (reset: {})",
            self.cli_path,
            req.agent_id,
            req.reset
        );

        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                match output.status.code() {
                    Some(code) => format!("exited with code {}", code),
                    None => "terminated by signal".to_string(),
                }
            } else {
                stderr
            };
            return Err(ProviderError::Subprocess(detail));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(extract_result(&stdout).unwrap_or_else(|| FALLBACK_REPLY.to_string()))
    }
}

impl Default for SubprocessInvoker {
    fn default() -> Self {
        Self::new()
    }
}

fn selected_model_arg(model: Option<&str>) -> Option<String> {
    model
        .map(str::trim)
        .filter(|m| !m.is_empty() && *m != "default")
        .map(ToString::to_string)
}

/// Extract the reply from line-delimited JSON output.
///
/// The reply is the `result` field of the last line whose `type` is
/// `"result"`. Lines that fail to parse as JSON are diagnostic noise and
/// skipped.
fn extract_result(stdout: &str) -> Option<String> {
    let mut last = None;

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        if value.get("type").and_then(|t| t.as_str()) == Some("result") {
            if let Some(text) = value.get("result").and_then(|r| r.as_str()) {
                last = Some(text.to_string());
            }
        }
    }

    last
}
