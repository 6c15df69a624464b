//! Job Models
//!
//! Status, snapshots and outcomes of dispatcher jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form job metadata. Immutable once the job is enqueued.
pub type JobMetadata = BTreeMap<String, String>;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Queued and running jobs are active; they block duplicates.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job's work reports when it returns.
///
/// Cancellation is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Completed { message: Option<String> },
    Failed { message: String },
    Cancelled,
}

impl JobOutcome {
    pub fn completed() -> Self {
        JobOutcome::Completed { message: None }
    }

    pub fn completed_with(message: impl Into<String>) -> Self {
        JobOutcome::Completed {
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        JobOutcome::Failed {
            message: message.into(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            JobOutcome::Completed { message } => message.as_deref(),
            JobOutcome::Failed { message } => Some(message),
            JobOutcome::Cancelled => None,
        }
    }
}

/// Point-in-time view of one job, as returned by `get_active_jobs` and
/// `job_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub run_id: String,
    pub operation: String,
    pub scope: String,
    pub priority: i32,
    pub metadata: JobMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    pub status: JobStatus,
    pub current_step: u32,
    pub max_step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_description: Option<String>,
    /// Final message (success summary or failure reason)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    /// Progress as a percentage (0-100); 0 when the job has no steps.
    pub fn progress_percent(&self) -> f64 {
        if self.max_step == 0 {
            return 0.0;
        }
        (self.current_step.min(self.max_step) as f64 / self.max_step as f64) * 100.0
    }
}
