//! LLM Provider Trait
//!
//! Defines the common interface for text-generation services. The engine
//! treats a provider as an opaque operation: conversation in, text out, may
//! fail.

use async_trait::async_trait;

use super::types::{LlmError, LlmRequestOptions, LlmResponse, LlmResult, Message, ProviderConfig};

/// Trait that all generation providers must implement.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the provider name for identification.
    fn name(&self) -> &str;

    /// Returns the current model being used.
    fn model(&self) -> &str;

    /// Send a conversation and get a complete response.
    ///
    /// # Arguments
    /// * `messages` - Conversation history, oldest first
    /// * `system` - Optional system prompt
    /// * `request_options` - Per-request overrides
    async fn send_message(
        &self,
        messages: Vec<Message>,
        system: Option<String>,
        request_options: LlmRequestOptions,
    ) -> LlmResult<LlmResponse>;

    /// Check if the provider is reachable and the credentials are accepted.
    async fn health_check(&self) -> LlmResult<()> {
        self.send_message(
            vec![Message::user("ping")],
            None,
            LlmRequestOptions {
                max_tokens_override: Some(1),
                ..Default::default()
            },
        )
        .await
        .map(|_| ())
    }

    /// Get the configuration for this provider, if it has one.
    fn config(&self) -> Option<&ProviderConfig> {
        None
    }
}

/// Helper function to create an error for missing API key
pub fn missing_api_key_error(provider: &str) -> LlmError {
    LlmError::AuthenticationFailed {
        message: format!("API key not configured for {}", provider),
    }
}

/// Helper function to parse HTTP error status codes
pub fn parse_http_error(status: u16, body: &str, provider: &str) -> LlmError {
    match status {
        401 => LlmError::AuthenticationFailed {
            message: format!("{}: Invalid API key", provider),
        },
        403 => LlmError::AuthenticationFailed {
            message: format!("{}: Access denied", provider),
        },
        404 => LlmError::ModelNotFound {
            model: body.to_string(),
        },
        408 => LlmError::Timeout {
            message: body.to_string(),
        },
        429 => LlmError::RateLimited {
            message: body.to_string(),
            retry_after: None,
        },
        400 => LlmError::InvalidRequest {
            message: body.to_string(),
        },
        500..=599 => LlmError::ServerError {
            message: body.to_string(),
            status: Some(status),
        },
        _ => LlmError::Other {
            message: format!("HTTP {}: {}", status, body),
        },
    }
}
