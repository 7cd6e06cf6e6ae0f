//! Provider invocation for ChatRelay.
#![allow(dead_code)]
//!
//! Two transports produce a reply for a conversation: a remote
//! chat-completion API and a locally spawned CLI subprocess. Both are
//! normalized behind one `invoke` contract so the dispatch loop stays
//! provider-agnostic. The variants share nothing beyond the signature, so
//! they are a tagged enum rather than trait objects.

use std::path::Path;
use thiserror::Error;

pub mod http;
pub mod subprocess;

pub use http::HttpInvoker;
pub use subprocess::SubprocessInvoker;

use crate::config::{AgentConfig, Settings};
use crate::core::history::Turn;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    Configuration(String),

    #[error("API error (HTTP {status}): {detail}")]
    Api { status: u16, detail: String },

    #[error("Subprocess failed: {0}")]
    Subprocess(String),

    #[error("Provider returned an empty response")]
    EmptyResponse,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Everything one invocation needs.
pub struct InvokeRequest<'a> {
    pub agent_id: &'a str,
    pub model: Option<&'a str>,
    pub message: &'a str,

    /// Trimmed conversation window, including the just-appended user turn.
    /// Only the HTTP transport sends it; the CLI keeps its own session.
    pub history: &'a [Turn],

    pub working_dir: Option<&'a Path>,

    /// Start a fresh session instead of resuming the prior one.
    pub reset: bool,
}

/// Provider invoker, selected per agent from its configuration.
#[derive(Debug)]
pub enum Invoker {
    Http(HttpInvoker),
    Subprocess(SubprocessInvoker),
}

impl Invoker {
    /// Build the invoker for an agent.
    ///
    /// `openai` is accepted for backward compatibility but deprecated; it
    /// routes to the same HTTP transport as `openrouter`. `claude` selects
    /// the legacy CLI subprocess path.
    pub fn for_agent(agent: &AgentConfig, settings: &Settings) -> Result<Invoker> {
        let provider = agent.provider.as_deref().unwrap_or("openrouter");

        match provider {
            "openrouter" => Ok(Invoker::Http(HttpInvoker::from_settings(settings))),
            "openai" => {
                tracing::warn!(
                    "Provider 'openai' is deprecated; routing to the HTTP completion provider"
                );
                Ok(Invoker::Http(HttpInvoker::from_settings(settings)))
            }
            "claude" => Ok(Invoker::Subprocess(SubprocessInvoker::from_settings(
                settings,
            ))),
            other => Err(ProviderError::Configuration(format!(
                "Unknown provider '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Invoker::Http(_) => "http",
            Invoker::Subprocess(_) => "subprocess",
        }
    }

    /// Produce a reply for the request, normalizing both transports into one
    /// response contract.
    pub async fn invoke(&self, req: &InvokeRequest<'_>) -> Result<String> {
        match self {
            Invoker::Http(http) => http.invoke(req).await,
            Invoker::Subprocess(subprocess) => subprocess.invoke(req).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_maps_to_http_variant() {
        let settings = Settings::default();
        let agent = AgentConfig {
            provider: Some("openai".to_string()),
            ..Default::default()
        };

        let invoker = Invoker::for_agent(&agent, &settings).unwrap();
        assert_eq!(invoker.name(), "http");
    }

    #[test]
    fn claude_maps_to_subprocess_variant() {
        let settings = Settings::default();
        let agent = AgentConfig {
            provider: Some("claude".to_string()),
            ..Default::default()
        };

        let invoker = Invoker::for_agent(&agent, &settings).unwrap();
        assert_eq!(invoker.name(), "subprocess");
    }

    #[test]
    fn unknown_provider_is_a_configuration_error() {
        let settings = Settings::default();
        let agent = AgentConfig {
            provider: Some("ouija".to_string()),
            ..Default::default()
        };

        let err = Invoker::for_agent(&agent, &settings).unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }
}
