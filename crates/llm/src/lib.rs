//! Story Pipeline LLM
//!
//! Provides a unified interface for the text-generation service the engine
//! calls:
//! - `LlmProvider` trait (conversation in, text out, may fail)
//! - Shared message/response/error types with transient-error classification
//! - An OpenAI-compatible HTTP provider and the HTTP client factory

pub mod http_client;
pub mod openai;
pub mod provider;
pub mod types;

// Re-export main types
pub use http_client::build_http_client;
pub use openai::OpenAICompatibleProvider;
pub use provider::LlmProvider;
pub use types::*;
