//! Model provider abstraction for fm-harness.
//!
//! Provides a unified async trait for requesting completions from a model,
//! plus the concrete providers the orchestrator can be configured with.
//!
//! # Overview
//!
//! This module defines the core [`ModelProvider`] trait and supporting types
//! for the agent runtime. The trait provides:
//!
//! - **Completions** via the [`ModelProvider::complete`] method
//! - **Standardized error handling** through [`ProviderError`]
//! - **Message formatting** with [`Message`] and [`Role`] types
//!
//! Two providers ship with this crate: [`StubProvider`], which refuses every
//! call and exists so an unconfigured system fails loudly rather than
//! silently, and [`ScriptProvider`], which pipes the conversation to an
//! external executable and reads the completion from its stdout. Hosted API
//! implementations follow the same trait and map their failure modes onto
//! [`ProviderError`] variants.
//!
//! # Implementation Guide
//!
//! To implement a new provider:
//!
//! 1. Create a struct holding client state (API key, HTTP client, etc.)
//! 2. Implement [`ModelProvider`] with your provider's API calls
//! 3. Map provider-specific errors to [`ProviderError`] variants

use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use fm_core::config::ModelConfig;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur when requesting a completion from a provider.
///
/// This enum standardizes error handling across provider implementations so
/// the retry layer can treat failure modes uniformly regardless of the
/// underlying provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Provider is not properly configured or initialized.
    ///
    /// Missing credentials, an absent script path, or using
    /// [`StubProvider`] where a real implementation is required.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// The provider's API or backing process returned an error.
    #[error("api error: {0}")]
    Api(String),

    /// Request was rate limited by the provider. The `retry_after_ms` field
    /// indicates how long to wait before retrying.
    #[error("rate limited - retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// Network, serialization, or other errors not covered above.
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// The role of a participant in a model conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instructions that seed the conversation: the agent's role briefing,
    /// task description, and directive grammar.
    System,
    /// Observations fed back to the model: command transcripts, file
    /// contents, verification feedback.
    User,
    /// The model's own prior replies, kept for conversation coherence.
    Assistant,
}

/// A single message in a model conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

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

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Response from a model completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// The model's reply text. Directive parsing happens downstream; this
    /// layer returns it verbatim.
    pub text: String,
    /// The model identifier that produced this completion.
    pub model: String,
    /// Token usage, when the provider reports it.
    pub usage: Option<Usage>,
}

/// Token usage statistics for a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// ---------------------------------------------------------------------------
// ModelProvider trait
// ---------------------------------------------------------------------------

/// Async trait for model provider implementations.
///
/// Implementations must be `Send + Sync` so a single provider can serve
/// concurrent agents.
///
/// # Errors
///
/// Map provider-specific errors to [`ProviderError`] variants:
///
/// - Authentication/configuration issues → [`ProviderError::NotConfigured`]
/// - API errors (4xx/5xx) → [`ProviderError::Api`]
/// - Rate limits → [`ProviderError::RateLimited`]
/// - Timeouts → [`ProviderError::Timeout`]
/// - Everything else → [`ProviderError::Other`]
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    /// Request a completion for the given conversation.
    async fn complete(&self, messages: Vec<Message>) -> Result<Completion, ProviderError>;

    /// Human-readable provider name, used for logging.
    fn name(&self) -> &str;
}

/// Build a provider from the model section of the config.
pub fn provider_from_config(
    cfg: &ModelConfig,
) -> Result<std::sync::Arc<dyn ModelProvider>, ProviderError> {
    match cfg.provider.as_str() {
        "stub" => Ok(std::sync::Arc::new(StubProvider::new("stub"))),
        "script" => {
            let path = cfg.script_path.clone().ok_or_else(|| {
                ProviderError::NotConfigured(
                    "model.script_path is required for the script provider".to_string(),
                )
            })?;
            Ok(std::sync::Arc::new(ScriptProvider::new(path)))
        }
        other => Err(ProviderError::NotConfigured(format!(
            "unknown provider '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// StubProvider – returns an error for every call.
// ---------------------------------------------------------------------------

/// A placeholder provider that always returns `NotConfigured`.
/// Hosted implementations (Anthropic, OpenAI, etc.) live in crates that
/// depend on this one.
#[derive(Debug, Clone)]
pub struct StubProvider {
    provider_name: String,
}

impl StubProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            provider_name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for StubProvider {
    async fn complete(&self, _messages: Vec<Message>) -> Result<Completion, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "{} provider is not configured - install a concrete implementation",
            self.provider_name
        )))
    }

    fn name(&self) -> &str {
        &self.provider_name
    }
}

// ---------------------------------------------------------------------------
// ScriptProvider – delegates to an external executable.
// ---------------------------------------------------------------------------

/// A provider backed by an external executable.
///
/// The conversation is serialized as a JSON array of [`Message`] values and
/// written to the script's stdin; whatever the script prints to stdout is
/// the completion text. A non-zero exit maps to [`ProviderError::Api`].
///
/// This is the integration seam for custom model gateways, and it is how
/// end-to-end tests drive the whole orchestrator deterministically.
#[derive(Debug, Clone)]
pub struct ScriptProvider {
    script: PathBuf,
}

impl ScriptProvider {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for ScriptProvider {
    async fn complete(&self, messages: Vec<Message>) -> Result<Completion, ProviderError> {
        let payload =
            serde_json::to_vec(&messages).map_err(|e| ProviderError::Other(e.to_string()))?;

        let mut child = tokio::process::Command::new(&self.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ProviderError::NotConfigured(format!(
                    "cannot execute {}: {e}",
                    self.script.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ProviderError::Other(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::Other(e.to_string()))?;

        if !output.status.success() {
            return Err(ProviderError::Api(format!(
                "script exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(Completion {
            text: String::from_utf8_lossy(&output.stdout).to_string(),
            model: format!("script:{}", self.script.display()),
            usage: None,
        })
    }

    fn name(&self) -> &str {
        "script"
    }
}
