//! OpenAI-Compatible Provider
//!
//! Implementation of the LlmProvider trait for any endpoint speaking the
//! OpenAI chat-completions protocol (OpenAI, OpenRouter, vLLM, LM Studio,
//! Ollama's `/v1` shim, ...).

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::provider::{missing_api_key_error, parse_http_error, LlmProvider};
use super::types::{
    LlmError, LlmRequestOptions, LlmResponse, LlmResult, Message, MessageRole, ProviderConfig,
    UsageStats,
};
use crate::http_client::build_http_client;

/// Default OpenAI API endpoint
const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Providers that accept requests without a bearer token.
const KEYLESS_PROVIDERS: [&str; 2] = ["local", "ollama"];

/// OpenAI-compatible provider
pub struct OpenAICompatibleProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAICompatibleProvider {
    /// Create a new provider with the given configuration
    pub fn new(config: ProviderConfig) -> LlmResult<Self> {
        let client = build_http_client(config.proxy_url.as_deref(), config.timeout())?;
        Ok(Self { config, client })
    }

    /// Get the API base URL
    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL)
    }

    fn requires_api_key(&self) -> bool {
        !KEYLESS_PROVIDERS.contains(&self.config.provider.as_str())
    }

    /// Build the request body for the API
    fn build_request_body(
        &self,
        messages: &[Message],
        system: Option<&str>,
        request_options: &LlmRequestOptions,
    ) -> serde_json::Value {
        let mut openai_messages: Vec<serde_json::Value> = Vec::new();

        if let Some(sys) = system {
            openai_messages.push(serde_json::json!({
                "role": "system",
                "content": sys
            }));
        }

        for msg in messages {
            let role = match msg.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            openai_messages.push(serde_json::json!({
                "role": role,
                "content": msg.content
            }));
        }

        serde_json::json!({
            "model": self.config.model,
            "messages": openai_messages,
            "max_tokens": request_options
                .max_tokens_override
                .unwrap_or(self.config.max_tokens),
            "temperature": request_options
                .temperature_override
                .unwrap_or(self.config.temperature),
            "stream": false,
        })
    }

    /// Parse a response from the API
    fn parse_response(&self, response: OpenAIResponse) -> LlmResponse {
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content);

        let usage = response
            .usage
            .map(|u| UsageStats {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        LlmResponse {
            content,
            usage,
            model: response.model.unwrap_or_else(|| self.config.model.clone()),
        }
    }
}

fn map_send_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout {
            message: e.to_string(),
        }
    } else {
        LlmError::NetworkError {
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.config.provider
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn send_message(
        &self,
        messages: Vec<Message>,
        system: Option<String>,
        request_options: LlmRequestOptions,
    ) -> LlmResult<LlmResponse> {
        let body = self.build_request_body(&messages, system.as_deref(), &request_options);

        let mut request = self
            .client
            .post(self.base_url())
            .header("Content-Type", "application/json")
            .json(&body);

        match self.config.api_key.as_ref() {
            Some(key) => {
                request = request.header("Authorization", format!("Bearer {}", key));
            }
            None if self.requires_api_key() => {
                return Err(missing_api_key_error(&self.config.provider));
            }
            None => {}
        }

        debug!(
            provider = %self.config.provider,
            model = %self.config.model,
            messages = messages.len(),
            "sending chat completion request"
        );

        let response = request.send().await.map_err(map_send_error)?;

        let status = response.status().as_u16();
        let body_text = response.text().await.map_err(map_send_error)?;

        if status != 200 {
            return Err(parse_http_error(status, &body_text, &self.config.provider));
        }

        let parsed: OpenAIResponse =
            serde_json::from_str(&body_text).map_err(|e| LlmError::ParseError {
                message: format!("Failed to parse response: {}", e),
            })?;

        Ok(self.parse_response(parsed))
    }

    fn config(&self) -> Option<&ProviderConfig> {
        Some(&self.config)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: Option<OpenAIMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}
