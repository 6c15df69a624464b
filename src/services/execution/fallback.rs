//! Generation Fallback Chain
//!
//! Ordered generation targets (primary first, then fallbacks by declared
//! priority) and the attempt log recorded while escalating across them.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use story_pipeline_llm::{LlmError, LlmProvider, OpenAICompatibleProvider};

use crate::models::settings::GenerationTargetConfig;
use crate::utils::error::{AppError, AppResult};

/// Why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The service returned nothing usable
    EmptyOutput,
    /// A validator rejected the output
    Validation,
    /// Network, timeout, rate limit or server error
    Transient,
    /// Rejected request or credentials; retrying the same target is pointless
    Fatal,
    /// Cancelled by the caller
    Cancelled,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::EmptyOutput => write!(f, "empty_output"),
            FailureClass::Validation => write!(f, "validation"),
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Fatal => write!(f, "fatal"),
            FailureClass::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FailureClass {
    /// Classify a provider error
    pub fn from_llm_error(err: &LlmError) -> Self {
        if err.is_transient() {
            FailureClass::Transient
        } else if matches!(err, LlmError::EmptyResponse { .. }) {
            FailureClass::EmptyOutput
        } else {
            FailureClass::Fatal
        }
    }

    /// Check if another attempt on the same target may succeed
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            FailureClass::EmptyOutput | FailureClass::Validation | FailureClass::Transient
        )
    }
}

/// Record of a single generation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// Target that was tried
    pub target: String,
    /// 1-based attempt number within the target
    pub attempt: u32,
    /// Whether this attempt succeeded
    pub success: bool,
    /// Failure class if failed
    pub failure_class: Option<FailureClass>,
    /// Error message if failed
    pub error_message: Option<String>,
    /// Duration of the attempt in milliseconds
    pub duration_ms: u64,
    /// Timestamp when attempt started
    pub started_at: String,
}

impl AttemptRecord {
    /// Create a successful attempt record
    pub fn success(target: impl Into<String>, attempt: u32, duration_ms: u64) -> Self {
        Self {
            target: target.into(),
            attempt,
            success: true,
            failure_class: None,
            error_message: None,
            duration_ms,
            started_at: Utc::now().to_rfc3339(),
        }
    }

    /// Create a failed attempt record
    pub fn failure(
        target: impl Into<String>,
        attempt: u32,
        class: FailureClass,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            target: target.into(),
            attempt,
            success: false,
            failure_class: Some(class),
            error_message: Some(error.into()),
            duration_ms,
            started_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Log of all attempts made for one chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    /// All attempts made
    pub attempts: Vec<AttemptRecord>,
    /// Total duration in milliseconds
    pub total_duration_ms: u64,
    /// Target that produced the accepted output (if any)
    pub successful_target: Option<String>,
    /// Whether execution ultimately succeeded
    pub overall_success: bool,
}

impl ExecutionLog {
    /// Create a new log
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attempt to the log
    pub fn add_attempt(&mut self, attempt: AttemptRecord) {
        self.total_duration_ms += attempt.duration_ms;
        if attempt.success {
            self.successful_target = Some(attempt.target.clone());
            self.overall_success = true;
        }
        self.attempts.push(attempt);
    }

    /// Get the number of failed attempts
    pub fn failed_attempts_count(&self) -> usize {
        self.attempts.iter().filter(|a| !a.success).count()
    }

    /// Attempts made against one target
    pub fn attempts_for(&self, target: &str) -> usize {
        self.attempts.iter().filter(|a| a.target == target).count()
    }

    /// Targets in the order they were first tried
    pub fn targets_tried(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for attempt in &self.attempts {
            if !seen.contains(&attempt.target.as_str()) {
                seen.push(&attempt.target);
            }
        }
        seen
    }
}

/// One generation configuration the executor can call
#[derive(Clone)]
pub struct GenerationTarget {
    pub name: String,
    pub priority: i32,
    pub provider: Arc<dyn LlmProvider>,
}

impl std::fmt::Debug for GenerationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationTarget")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("provider", &self.provider.name())
            .field("model", &self.provider.model())
            .finish()
    }
}

impl GenerationTarget {
    pub fn new(name: impl Into<String>, priority: i32, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            name: name.into(),
            priority,
            provider,
        }
    }

    /// Build a target backed by the OpenAI-compatible HTTP provider
    pub fn from_config(config: &GenerationTargetConfig) -> AppResult<Self> {
        let provider = OpenAICompatibleProvider::new(config.provider.clone())?;
        Ok(Self::new(config.name.clone(), config.priority, Arc::new(provider)))
    }
}

/// Generation Fallback Chain
///
/// Targets ordered by priority (stable for equal priorities). The first is
/// the primary; the rest are fallbacks tried in order.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    targets: Vec<GenerationTarget>,
}

impl FallbackChain {
    /// Create a chain; fails when no target is given
    pub fn new(mut targets: Vec<GenerationTarget>) -> AppResult<Self> {
        if targets.is_empty() {
            return Err(AppError::config("no generation targets configured"));
        }
        targets.sort_by_key(|t| t.priority);
        Ok(Self { targets })
    }

    /// Create a chain of HTTP targets from configuration
    pub fn from_configs<'a, I>(configs: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = &'a GenerationTargetConfig>,
    {
        let targets = configs
            .into_iter()
            .map(GenerationTarget::from_config)
            .collect::<AppResult<Vec<_>>>()?;
        Self::new(targets)
    }

    /// Get the primary target
    pub fn primary(&self) -> &GenerationTarget {
        &self.targets[0]
    }

    /// Get the fallback targets in order
    pub fn fallbacks(&self) -> &[GenerationTarget] {
        &self.targets[1..]
    }

    /// Get all targets in order (primary + fallbacks)
    pub fn all_targets(&self) -> &[GenerationTarget] {
        &self.targets
    }
}
