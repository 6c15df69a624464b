//! Chunk Models
//!
//! Segments, chunks and the token budget the planner works within.

use serde::{Deserialize, Serialize};

use crate::models::settings::ChunkingSettings;

/// How chunk outputs relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    /// Disjoint chunks whose outputs annotate source lines
    Deterministic,
    /// Overlapping chunks whose outputs are free text merged at the seams
    Narrative,
}

/// Atomic unit the planner never splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Byte offset of the first character
    pub start: usize,
    /// Byte offset one past the last character
    pub end: usize,
    pub tokens: usize,
}

/// A contiguous slice of the source handed to one generation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: usize,
    /// Byte offset into the source, inclusive
    pub start: usize,
    /// Byte offset into the source, exclusive
    pub end: usize,
    pub token_count: usize,
    /// Tokens at the start of this chunk already covered by the previous one
    #[serde(default)]
    pub overlap_tokens: usize,
    /// Backing line identifiers, for line-addressed sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub row_ids: Vec<u64>,
    pub text: String,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// How token counts are estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum TokenEstimator {
    /// Whitespace-delimited word count
    #[default]
    Words,
    /// Fixed characters-per-token ratio
    CharsPerToken(f32),
}

impl TokenEstimator {
    pub fn estimate(&self, text: &str) -> usize {
        match self {
            TokenEstimator::Words => text.split_whitespace().count(),
            TokenEstimator::CharsPerToken(ratio) => {
                let chars = text.trim().chars().count();
                if chars == 0 {
                    0
                } else {
                    ((chars as f32 / ratio).ceil() as usize).max(1)
                }
            }
        }
    }
}

/// Token budget for one planning pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkBudget {
    pub min_tokens: usize,
    pub target_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub estimator: TokenEstimator,
}

impl ChunkBudget {
    pub fn new(min_tokens: usize, target_tokens: usize, max_tokens: usize) -> Self {
        Self {
            min_tokens,
            target_tokens,
            max_tokens,
            overlap_tokens: 0,
            estimator: TokenEstimator::Words,
        }
    }

    pub fn with_overlap(mut self, overlap_tokens: usize) -> Self {
        self.overlap_tokens = overlap_tokens;
        self
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Same budget with overlap forced off.
    pub fn disjoint(mut self) -> Self {
        self.overlap_tokens = 0;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min_tokens == 0 {
            return Err("minTokens must be positive".to_string());
        }
        if self.min_tokens > self.target_tokens || self.target_tokens > self.max_tokens {
            return Err(format!(
                "budget must satisfy min <= target <= max (got {} / {} / {})",
                self.min_tokens, self.target_tokens, self.max_tokens
            ));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err("overlapTokens must be smaller than maxTokens".to_string());
        }
        Ok(())
    }
}

impl From<&ChunkingSettings> for ChunkBudget {
    fn from(settings: &ChunkingSettings) -> Self {
        let estimator = match settings.chars_per_token {
            Some(ratio) => TokenEstimator::CharsPerToken(ratio),
            None => TokenEstimator::Words,
        };
        ChunkBudget::new(
            settings.min_tokens,
            settings.target_tokens,
            settings.max_tokens,
        )
        .with_overlap(settings.overlap_tokens)
        .with_estimator(estimator)
    }
}
