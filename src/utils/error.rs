//! Error Handling
//!
//! Unified error types for the engine.
//! Uses thiserror for ergonomic error definitions.

use story_pipeline_core::CoreError;
use story_pipeline_llm::LlmError;
use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite errors (auto-converted from rusqlite::Error)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors raised by collaborator traits
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Generation service errors
    #[error("Generation error: {0}")]
    Llm(#[from] LlmError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for engine errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Storage adapters implement core traits, so their errors flow back as `CoreError`.
impl From<AppError> for CoreError {
    fn from(err: AppError) -> CoreError {
        match err {
            AppError::Core(inner) => inner,
            AppError::NotFound(msg) => CoreError::NotFound(msg),
            AppError::Validation(msg) => CoreError::Validation(msg),
            AppError::Config(msg) => CoreError::Config(msg),
            other => CoreError::Persistence(other.to_string()),
        }
    }
}

/// Convert AppError to a string suitable for job outcome messages
impl From<AppError> for String {
    fn from(err: AppError) -> String {
        err.to_string()
    }
}
