//! OpenRouter-compatible HTTP completion provider.
#![allow(dead_code)]

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;

use super::{InvokeRequest, ProviderError, Result};
use crate::config::Settings;
use crate::core::history::Turn;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";

#[derive(Debug)]
pub struct HttpInvoker {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            api_key: env::var("OPENROUTER_API_KEY").ok(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Build from settings; the environment credential wins over settings so
    /// secrets can stay out of the settings file.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut invoker = Self::new();

        if invoker.api_key.is_none() {
            invoker.api_key = settings.models.openrouter.api_key.clone();
        }
        if let Some(base_url) = &settings.models.openrouter.base_url {
            invoker.base_url = base_url.clone();
        }
        if let Some(model) = &settings.models.openrouter.model {
            invoker.default_model = model.clone();
        }

        invoker
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn bearer(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::Configuration("OPENROUTER_API_KEY not set".to_string())
        })
    }

    /// Send the full trimmed conversation window and return the assistant
    /// reply. An empty reply is a provider failure, not a blank chat message.
    pub async fn invoke(&self, req: &InvokeRequest<'_>) -> Result<String> {
        let api_key = self.bearer()?;

        let model = req
            .model
            .map(str::trim)
            .filter(|m| !m.is_empty() && *m != "default")
            .unwrap_or(&self.default_model);

        let request = ChatRequest {
            model: model.to_string(),
            messages: req.history.iter().map(wire_message).collect(),
        };

        tracing::debug!(
            "HTTP completion for agent {} ({} turns, model {})",
            req.agent_id,
            request.messages.len(),
            model
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                detail,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        extract_content(chat_response)
    }
}

impl Default for HttpInvoker {
    fn default() -> Self {
        Self::new()
    }
}

fn wire_message(turn: &Turn) -> Message {
    Message {
        role: turn.role.as_str(),
        content: turn.content.clone(),
    }
}

/// Pull the assistant message out of a completion response.
fn extract_content(response: ChatResponse) -> Result<String> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    let content = content.trim();
    if content.is_empty() {
        return Err(ProviderError::EmptyResponse);
    }

    Ok(content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn extract_content_returns_assistant_text() {
        let response: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"hi there"}}]}"#).unwrap();
        assert_eq!(extract_content(response).unwrap(), "hi there");
    }

    #[test]
    fn empty_content_is_a_provider_failure() {
        let response: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  "}}]}"#).unwrap();
        assert!(matches!(
            extract_content(response),
            Err(ProviderError::EmptyResponse)
        ));

        let response: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{}}]}"#).unwrap();
        assert!(matches!(
            extract_content(response),
            Err(ProviderError::EmptyResponse)
        ));

        let response: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(
            extract_content(response),
            Err(ProviderError::EmptyResponse)
        ));
    }

    #[test]
    fn missing_credential_fails_at_invocation() {
        let invoker = HttpInvoker {
            client: Client::new(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        };
        assert!(matches!(
            invoker.bearer(),
            Err(ProviderError::Configuration(_))
        ));
    }

    /// Serve a single canned HTTP response on a local socket.
    async fn one_shot_server(status_line: &'static str, body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // Drain the request: headers, then the declared body length.
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(header_end) = find_header_end(&buf) {
                    let headers = String::from_utf8_lossy(&buf[..header_end]);
                    let content_length = headers
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok()))
                        .unwrap_or(0);
                    if buf.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    fn find_header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    }

    fn request<'a>(history: &'a [Turn]) -> InvokeRequest<'a> {
        InvokeRequest {
            agent_id: "default",
            model: None,
            message: "hello",
            history,
            working_dir: None,
            reset: false,
        }
    }

    #[tokio::test]
    async fn completes_against_local_endpoint() {
        let base_url = one_shot_server(
            "HTTP/1.1 200 OK",
            r#"{"choices":[{"message":{"content":"hi there"}}]}"#,
        )
        .await;

        let invoker = HttpInvoker::new()
            .with_api_key("test-key")
            .with_base_url(base_url);

        let history = vec![Turn::user("hello")];
        let reply = invoker.invoke(&request(&history)).await.unwrap();
        assert_eq!(reply, "hi there");
    }

    #[tokio::test]
    async fn empty_assistant_message_fails_invocation() {
        let base_url = one_shot_server(
            "HTTP/1.1 200 OK",
            r#"{"choices":[{"message":{"content":""}}]}"#,
        )
        .await;

        let invoker = HttpInvoker::new()
            .with_api_key("test-key")
            .with_base_url(base_url);

        let history = vec![Turn::user("hello")];
        let err = invoker.invoke(&request(&history)).await.unwrap_err();
        assert!(matches!(err, ProviderError::EmptyResponse));
    }

    #[tokio::test]
    async fn non_success_status_carries_body_detail() {
        let base_url = one_shot_server(
            "HTTP/1.1 429 Too Many Requests",
            r#"{"error":"rate limited"}"#,
        )
        .await;

        let invoker = HttpInvoker::new()
            .with_api_key("test-key")
            .with_base_url(base_url);

        let history = vec![Turn::user("hello")];
        match invoker.invoke(&request(&history)).await.unwrap_err() {
            ProviderError::Api { status, detail } => {
                assert_eq!(status, 429);
                assert!(detail.contains("rate limited"));
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }
}
