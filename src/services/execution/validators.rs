//! Output Validators
//!
//! Domain rules applied to every generated output before it is accepted.
//! A validator sees the chunk input and the candidate output and either
//! passes it, repairs it in place, or fails it with a correction that is
//! sent back on the next attempt.

use std::sync::Arc;

use regex::Regex;

use crate::services::chunking::overlay::{parse_annotations, LINE_ID_SEPARATOR};
use crate::utils::error::{AppError, AppResult};

/// Result of validating one output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Output accepted after a local fix
    Repaired { output: String, note: String },
    /// Output rejected; `correction` is appended to the retried request
    Fail { reason: String, correction: String },
}

impl Verdict {
    pub fn fail(reason: impl Into<String>, correction: impl Into<String>) -> Self {
        Verdict::Fail {
            reason: reason.into(),
            correction: correction.into(),
        }
    }
}

/// A single domain rule
pub trait OutputValidator: Send + Sync {
    /// Rule name reported in corrections and logs
    fn name(&self) -> &str;

    fn validate(&self, input: &str, output: &str) -> Verdict;
}

// ============================================================================
// Built-in validators
// ============================================================================

/// Rejects blank output
#[derive(Debug, Clone, Default)]
pub struct NonEmptyValidator;

impl OutputValidator for NonEmptyValidator {
    fn name(&self) -> &str {
        "non_empty"
    }

    fn validate(&self, _input: &str, output: &str) -> Verdict {
        if output.trim().is_empty() {
            Verdict::fail(
                "output is empty",
                "Your previous reply was empty. Return the complete result for the text above.",
            )
        } else {
            Verdict::Pass
        }
    }
}

/// Rejects output much shorter than its input (truncated or summarized)
#[derive(Debug, Clone)]
pub struct LengthRatioValidator {
    min_ratio: f32,
}

impl LengthRatioValidator {
    pub fn new(min_ratio: f32) -> Self {
        Self { min_ratio }
    }
}

impl OutputValidator for LengthRatioValidator {
    fn name(&self) -> &str {
        "length_ratio"
    }

    fn validate(&self, input: &str, output: &str) -> Verdict {
        let input_len = input.trim().chars().count();
        if input_len == 0 {
            return Verdict::Pass;
        }
        let ratio = output.trim().chars().count() as f32 / input_len as f32;
        if ratio < self.min_ratio {
            Verdict::fail(
                format!(
                    "output is {:.0}% of the input length (minimum {:.0}%)",
                    ratio * 100.0,
                    self.min_ratio * 100.0
                ),
                "Your previous reply was too short. Do not summarize or omit passages; \
                 return the full text.",
            )
        } else {
            Verdict::Pass
        }
    }
}

/// Requires at least `min_count` matches of a marker pattern
#[derive(Debug, Clone)]
pub struct MarkerCountValidator {
    label: String,
    pattern: Regex,
    min_count: usize,
}

impl MarkerCountValidator {
    pub fn new(label: impl Into<String>, pattern: &str, min_count: usize) -> AppResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| AppError::config(format!("invalid marker pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            label: label.into(),
            pattern,
            min_count,
        })
    }
}

impl OutputValidator for MarkerCountValidator {
    fn name(&self) -> &str {
        &self.label
    }

    fn validate(&self, _input: &str, output: &str) -> Verdict {
        let found = self.pattern.find_iter(output).count();
        if found < self.min_count {
            Verdict::fail(
                format!(
                    "found {} {} marker(s), expected at least {}",
                    found, self.label, self.min_count
                ),
                format!(
                    "Your previous reply contained {} {} marker(s); include at least {}.",
                    found, self.label, self.min_count
                ),
            )
        } else {
            Verdict::Pass
        }
    }
}

/// Requires an annotation for every must-annotate line.
///
/// Exactly one missing line is filled with the placeholder annotation;
/// more than one is a failure.
#[derive(Debug, Clone)]
pub struct RequiredAnnotationValidator {
    required: Vec<u64>,
    placeholder: String,
}

impl RequiredAnnotationValidator {
    pub fn new(required: Vec<u64>, placeholder: impl Into<String>) -> Self {
        Self {
            required,
            placeholder: placeholder.into(),
        }
    }
}

impl OutputValidator for RequiredAnnotationValidator {
    fn name(&self) -> &str {
        "required_annotations"
    }

    fn validate(&self, _input: &str, output: &str) -> Verdict {
        let overlay = parse_annotations(output);
        let missing: Vec<u64> = self
            .required
            .iter()
            .copied()
            .filter(|id| !overlay.contains_key(id))
            .collect();

        match missing.as_slice() {
            [] => Verdict::Pass,
            [only] => {
                let mut repaired = output.trim_end().to_string();
                if !repaired.is_empty() {
                    repaired.push('\n');
                }
                repaired.push_str(&format!("{}{} {}", only, LINE_ID_SEPARATOR, self.placeholder));
                Verdict::Repaired {
                    output: repaired,
                    note: format!("line {} auto-filled with {}", only, self.placeholder),
                }
            }
            many => {
                let ids = many
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                Verdict::fail(
                    format!("{} lines left unannotated: {}", many.len(), ids),
                    format!(
                        "Your previous reply skipped lines {}. Annotate every numbered line, \
                         one `id{} annotation` per line.",
                        ids, LINE_ID_SEPARATOR
                    ),
                )
            }
        }
    }
}

// ============================================================================
// Validator set
// ============================================================================

/// Ordered validators applied as one rule set
#[derive(Clone, Default)]
pub struct ValidatorSet {
    validators: Vec<Arc<dyn OutputValidator>>,
}

impl std::fmt::Debug for ValidatorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.validators.iter().map(|v| v.name().to_string()))
            .finish()
    }
}

/// Outcome of running every validator in a set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationReport {
    Accepted { output: String, repairs: Vec<String> },
    Rejected { rule: String, reason: String, correction: String },
}

impl ValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validator: impl OutputValidator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn push(&mut self, validator: Arc<dyn OutputValidator>) {
        self.validators.push(validator);
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Run validators in order. Repairs feed the repaired output into the
    /// following validators; the first failure stops the run.
    pub fn run(&self, input: &str, output: &str) -> ValidationReport {
        let mut current = output.to_string();
        let mut repairs = Vec::new();

        for validator in &self.validators {
            match validator.validate(input, &current) {
                Verdict::Pass => {}
                Verdict::Repaired { output, note } => {
                    current = output;
                    repairs.push(note);
                }
                Verdict::Fail { reason, correction } => {
                    return ValidationReport::Rejected {
                        rule: validator.name().to_string(),
                        reason,
                        correction,
                    };
                }
            }
        }

        ValidationReport::Accepted {
            output: current,
            repairs,
        }
    }
}
