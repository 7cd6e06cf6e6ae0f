//! Agent execution contracts: timeout, retries, and failure handling.

use std::time::Duration;

use crate::providers::{InvokeRequest, Invoker, ProviderError};

#[derive(Debug, Clone)]
pub struct ExecutionContract {
    pub timeout_seconds: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ExecutionContract {
    fn default() -> Self {
        Self {
            timeout_seconds: 240,
            retries: 1,
            retry_backoff_ms: 600,
        }
    }
}

impl ExecutionContract {
    /// Per-provider tuning; CLI sessions tend to run longer than one HTTP
    /// round-trip.
    pub fn for_provider(provider: &str) -> Self {
        match provider {
            "claude" => Self {
                timeout_seconds: 420,
                retries: 1,
                retry_backoff_ms: 800,
            },
            _ => Self::default(),
        }
    }
}

/// Invoke a provider under a contract.
///
/// Every attempt has an upper bound; a timed-out attempt surfaces as a
/// `ProviderError::Timeout` so the queue item fails rather than wedging in
/// processing. Configuration errors are not retried.
pub async fn execute_with_contract(
    invoker: &Invoker,
    req: &InvokeRequest<'_>,
    contract: &ExecutionContract,
) -> Result<String, ProviderError> {
    let attempts = contract.retries + 1;
    let timeout = Duration::from_secs(contract.timeout_seconds);
    let mut last_error: Option<ProviderError> = None;

    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, invoker.invoke(req)).await {
            Ok(Ok(text)) => return Ok(text),
            Ok(Err(e)) => {
                if matches!(e, ProviderError::Configuration(_)) {
                    return Err(e);
                }
                tracing::warn!(
                    "Invocation attempt {}/{} failed for agent {}: {}",
                    attempt,
                    attempts,
                    req.agent_id,
                    e
                );
                last_error = Some(e);
            }
            Err(_) => {
                tracing::warn!(
                    "Invocation attempt {}/{} timed out for agent {} after {}s",
                    attempt,
                    attempts,
                    req.agent_id,
                    contract.timeout_seconds
                );
                last_error = Some(ProviderError::Timeout(contract.timeout_seconds));
            }
        }

        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(contract.retry_backoff_ms)).await;
        }
    }

    Err(last_error
        .unwrap_or_else(|| ProviderError::Subprocess("invocation failed for unknown reason".to_string())))
}
