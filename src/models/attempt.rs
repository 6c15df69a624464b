//! Attempt Models
//!
//! The per-call result consumed by the executor loop, and the terminal
//! attempt surfaced to callers.

use serde::{Deserialize, Serialize};

/// Result of one generation attempt after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    /// Output passed every validator
    Ok(String),
    /// Worth another attempt on the same target
    Retry(String),
    /// No further attempt on this target can succeed
    Fatal(String),
}

impl AttemptResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, AttemptResult::Ok(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            AttemptResult::Ok(_) => None,
            AttemptResult::Retry(reason) | AttemptResult::Fatal(reason) => Some(reason),
        }
    }
}

/// The attempt that decided a chunk's fate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    /// 1-based attempt number within its target
    pub number: u32,
    /// Generated text; empty when the call produced nothing usable
    pub text: String,
    pub failure_reason: Option<String>,
    pub used_fallback: bool,
    /// Name of the generation target that produced `text`
    pub target: String,
}

impl Attempt {
    pub fn succeeded(&self) -> bool {
        self.failure_reason.is_none()
    }
}
