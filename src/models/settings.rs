//! Settings Models
//!
//! Engine configuration stored in config.json. Every field has a default so
//! a partial file (or `{}`) deserializes into a working configuration.

use serde::{Deserialize, Serialize};
use story_pipeline_llm::ProviderConfig;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub merger: MergerSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub steps: StepSettings,
    /// Generation targets; the lowest priority value is the primary.
    #[serde(default)]
    pub generation: Vec<GenerationTargetConfig>,
}

// ============================================================================
// Sections
// ============================================================================

/// Task dispatcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherSettings {
    /// Maximum number of jobs running at once across all scopes
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Finished jobs kept for status queries
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_history_limit() -> usize {
    256
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            history_limit: default_history_limit(),
        }
    }
}

/// Chunk planner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingSettings {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Tokens re-included at the start of each chunk (narrative mode)
    #[serde(default)]
    pub overlap_tokens: usize,
    /// Fixed characters-per-token ratio; whitespace word count when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chars_per_token: Option<f32>,
}

fn default_min_tokens() -> usize {
    1000
}

fn default_target_tokens() -> usize {
    1500
}

fn default_max_tokens() -> usize {
    2000
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            min_tokens: default_min_tokens(),
            target_tokens: default_target_tokens(),
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
            chars_per_token: None,
        }
    }
}

/// Overlap merger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergerSettings {
    /// Longest suffix/prefix overlap searched, in characters
    #[serde(default = "default_max_search_chars")]
    pub max_search_chars: usize,
    /// Shorter overlaps are treated as coincidence and kept. Lower this when
    /// chunk overlap is configured below this many characters.
    #[serde(default = "default_min_overlap_chars")]
    pub min_overlap_chars: usize,
}

fn default_max_search_chars() -> usize {
    2000
}

fn default_min_overlap_chars() -> usize {
    24
}

impl Default for MergerSettings {
    fn default() -> Self {
        Self {
            max_search_chars: default_max_search_chars(),
            min_overlap_chars: default_min_overlap_chars(),
        }
    }
}

/// Resilient executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSettings {
    #[serde(default = "default_max_attempts_primary")]
    pub max_attempts_primary: u32,
    #[serde(default = "default_max_attempts_fallback")]
    pub max_attempts_fallback: u32,
    /// Backoff before retrying a transient failure is `base × attempt`
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Minimum output/input length ratio accepted by the length validator
    #[serde(default = "default_min_length_ratio")]
    pub min_length_ratio: f32,
    /// Run one best-effort diagnostic call after terminal failure
    #[serde(default)]
    pub capture_diagnostics: bool,
    /// Annotation written when exactly one required line was left untagged
    #[serde(default = "default_placeholder_annotation")]
    pub placeholder_annotation: String,
}

fn default_max_attempts_primary() -> u32 {
    3
}

fn default_max_attempts_fallback() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    2000
}

fn default_min_length_ratio() -> f32 {
    0.5
}

fn default_placeholder_annotation() -> String {
    "[NARRATOR]".to_string()
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_attempts_primary: default_max_attempts_primary(),
            max_attempts_fallback: default_max_attempts_fallback(),
            backoff_base_ms: default_backoff_base_ms(),
            min_length_ratio: default_min_length_ratio(),
            capture_diagnostics: false,
            placeholder_annotation: default_placeholder_annotation(),
        }
    }
}

/// Step orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSettings {
    /// Absolute ceiling for one start/resume call
    #[serde(default = "default_wall_clock_limit_secs")]
    pub wall_clock_limit_secs: u64,
    /// Pause between a checker rejection and the next executor run
    #[serde(default)]
    pub rejection_delay_ms: u64,
}

fn default_wall_clock_limit_secs() -> u64 {
    4 * 60 * 60
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            wall_clock_limit_secs: default_wall_clock_limit_secs(),
            rejection_delay_ms: 0,
        }
    }
}

/// One generation service configuration (primary or fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTargetConfig {
    /// Display name reported in job messages
    pub name: String,
    /// Pipeline this target serves ("tagging", "narrative", ...); all when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Lower value is tried first
    #[serde(default)]
    pub priority: i32,
    pub provider: ProviderConfig,
}

impl PartialEq for GenerationTargetConfig {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.role == other.role
            && self.priority == other.priority
            && self.provider.provider == other.provider.provider
            && self.provider.model == other.provider.model
    }
}

impl GenerationTargetConfig {
    pub fn serves(&self, role: &str) -> bool {
        self.role.as_deref().map_or(true, |r| r == role)
    }
}

// ============================================================================
// Updates & validation
// ============================================================================

/// Partial update of the tunables most often changed at runtime
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub max_concurrency: Option<usize>,
    pub max_attempts_primary: Option<u32>,
    pub max_attempts_fallback: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub capture_diagnostics: Option<bool>,
    pub wall_clock_limit_secs: Option<u64>,
}

impl PipelineConfig {
    /// Apply a partial update to the configuration
    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(n) = update.max_concurrency {
            self.dispatcher.max_concurrency = n;
        }
        if let Some(n) = update.max_attempts_primary {
            self.executor.max_attempts_primary = n;
        }
        if let Some(n) = update.max_attempts_fallback {
            self.executor.max_attempts_fallback = n;
        }
        if let Some(ms) = update.backoff_base_ms {
            self.executor.backoff_base_ms = ms;
        }
        if let Some(enabled) = update.capture_diagnostics {
            self.executor.capture_diagnostics = enabled;
        }
        if let Some(secs) = update.wall_clock_limit_secs {
            self.steps.wall_clock_limit_secs = secs;
        }
    }

    /// Generation targets serving `role`, ordered by priority.
    pub fn targets_for(&self, role: &str) -> Vec<&GenerationTargetConfig> {
        let mut targets: Vec<_> = self.generation.iter().filter(|t| t.serves(role)).collect();
        targets.sort_by_key(|t| t.priority);
        targets
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.dispatcher.max_concurrency == 0 {
            return Err("dispatcher.maxConcurrency must be at least 1".to_string());
        }

        let c = &self.chunking;
        if c.min_tokens == 0 {
            return Err("chunking.minTokens must be positive".to_string());
        }
        if c.min_tokens > c.target_tokens || c.target_tokens > c.max_tokens {
            return Err(format!(
                "chunking budget must satisfy min <= target <= max (got {} / {} / {})",
                c.min_tokens, c.target_tokens, c.max_tokens
            ));
        }
        if c.overlap_tokens >= c.max_tokens {
            return Err("chunking.overlapTokens must be smaller than maxTokens".to_string());
        }
        if let Some(ratio) = c.chars_per_token {
            if ratio.is_nan() || ratio <= 0.0 {
                return Err("chunking.charsPerToken must be positive".to_string());
            }
        }

        if self.executor.max_attempts_primary == 0 || self.executor.max_attempts_fallback == 0 {
            return Err("executor attempt budgets must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.executor.min_length_ratio) {
            return Err("executor.minLengthRatio must be within 0.0..=1.0".to_string());
        }

        if self.steps.wall_clock_limit_secs == 0 {
            return Err("steps.wallClockLimitSecs must be positive".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for target in &self.generation {
            if target.name.trim().is_empty() {
                return Err("generation target name cannot be empty".to_string());
            }
            if !names.insert(target.name.as_str()) {
                return Err(format!("duplicate generation target: {}", target.name));
            }
        }

        Ok(())
    }
}
