//! Generation Types
//!
//! Conversation messages, request options, responses and errors shared by
//! every provider.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Per-request overrides of the provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmRequestOptions {
    pub temperature_override: Option<f32>,
    pub max_tokens_override: Option<u32>,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Complete (non-streamed) response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated text, `None` when the model returned no content
    pub content: Option<String>,
    pub usage: UsageStats,
    pub model: String,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            usage: UsageStats::default(),
            model: model.into(),
        }
    }

    /// The generated text, or an empty string.
    pub fn text_or_empty(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Connection settings for one provider/model pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Provider identifier, e.g. "openai", "openrouter", "local"
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// API key; never written back to disk
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Proxy URL, e.g. "socks5://127.0.0.1:1080"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_secs() -> u64 {
    300
}

impl ProviderConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            proxy_url: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Errors returned by providers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmError {
    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Request timed out: {message}")]
    Timeout { message: String },

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("Server error ({status:?}): {message}")]
    ServerError { message: String, status: Option<u16> },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Parse error: {message}")]
    ParseError { message: String },

    #[error("Empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("Provider error: {message}")]
    Other { message: String },
}

impl LlmError {
    /// Errors worth retrying against the same provider after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::NetworkError { .. }
                | LlmError::Timeout { .. }
                | LlmError::RateLimited { .. }
                | LlmError::ServerError { .. }
        )
    }
}

/// Result type alias for provider calls
pub type LlmResult<T> = Result<T, LlmError>;
