//! Progress Sink
//!
//! The progress-broadcast collaborator. Jobs, the dispatcher and the step
//! orchestrator report through this trait; concrete sinks (tracing, channel
//! fan-out, persisted logs) live in the engine crate or in the embedding
//! application.
//!
//! Every method is best-effort: a sink must never fail the operation that
//! reports to it, so none of them return a `Result`.

use serde::{Deserialize, Serialize};

/// Severity attached to a progress log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for ProgressLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressLevel::Debug => write!(f, "debug"),
            ProgressLevel::Info => write!(f, "info"),
            ProgressLevel::Warning => write!(f, "warning"),
            ProgressLevel::Error => write!(f, "error"),
        }
    }
}

/// Receiver of job progress.
pub trait ProgressSink: Send + Sync {
    /// Append a human-readable log line to the run identified by `run_id`.
    fn append(&self, run_id: &str, message: &str, level: ProgressLevel);

    /// Publish the step cursor of a job or step execution.
    fn broadcast_step_progress(&self, id: &str, current: u32, max: u32, description: Option<&str>);

    /// Publish the terminal status of a job or step execution.
    fn broadcast_completion(&self, id: &str, status: &str);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn append(&self, _run_id: &str, _message: &str, _level: ProgressLevel) {}

    fn broadcast_step_progress(
        &self,
        _id: &str,
        _current: u32,
        _max: u32,
        _description: Option<&str>,
    ) {
    }

    fn broadcast_completion(&self, _id: &str, _status: &str) {}
}
