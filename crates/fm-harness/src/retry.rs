use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::provider::{Completion, Message, ModelProvider, ProviderError};
use fm_core::config::ModelConfig;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Terminal error once the retry budget is spent. Every provider failure
/// mode collapses into this one error; callers never see the individual
/// attempts.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("model call failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// First backoff delay; each subsequent delay doubles.
    pub backoff_base: Duration,
    /// Maximum duration for an individual call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            call_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &ModelConfig) -> Self {
        Self {
            max_attempts: cfg.max_retries,
            backoff_base: cfg.backoff_base(),
            call_timeout: cfg.request_timeout(),
        }
    }

    /// Delay before the n-th retry (n starting at 1): base, 2*base, 4*base...
    fn delay(&self, retry: u32) -> Duration {
        let shift = (retry - 1).min(6);
        self.backoff_base * (1u32 << shift)
    }
}

// ---------------------------------------------------------------------------
// ModelClient
// ---------------------------------------------------------------------------

/// Provider wrapper that retries transient failures with exponential
/// backoff. The agent loop only ever talks to the model through this type.
#[derive(Clone)]
pub struct ModelClient {
    provider: Arc<dyn ModelProvider>,
    policy: RetryPolicy,
}

impl ModelClient {
    pub fn new(provider: Arc<dyn ModelProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Request a completion, retrying up to the policy's attempt budget.
    ///
    /// Rate-limit hints from the provider stretch the next delay when they
    /// exceed the exponential schedule.
    pub async fn complete(&self, messages: Vec<Message>) -> Result<Completion, RetryError> {
        let mut last = String::new();
        let mut hint: Option<u64> = None;

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                let mut wait = self.policy.delay(attempt - 1);
                if let Some(ms) = hint.take() {
                    wait = wait.max(Duration::from_millis(ms));
                }
                debug!(attempt, wait_ms = wait.as_millis() as u64, "backing off before retry");
                tokio::time::sleep(wait).await;
            }

            let call = self.provider.complete(messages.clone());
            match tokio::time::timeout(self.policy.call_timeout, call).await {
                Ok(Ok(completion)) => {
                    debug!(attempt, provider = self.provider.name(), "completion received");
                    return Ok(completion);
                }
                Ok(Err(ProviderError::RateLimited { retry_after_ms })) => {
                    warn!(attempt, retry_after_ms, "provider rate limited");
                    hint = Some(retry_after_ms);
                    last = ProviderError::RateLimited { retry_after_ms }.to_string();
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "provider call failed");
                    last = e.to_string();
                }
                Err(_elapsed) => {
                    warn!(attempt, timeout_secs = self.policy.call_timeout.as_secs(), "provider call timed out");
                    last = ProviderError::Timeout.to_string();
                }
            }
        }

        Err(RetryError::Exhausted {
            attempts: self.policy.max_attempts,
            last,
        })
    }
}
