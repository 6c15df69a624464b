//! Persistence Collaborators
//!
//! Records and traits for the state the engine hands to durable storage:
//! source documents, per-line annotation overlays and step executions.
//! The engine never owns storage; it reads and writes exclusively through
//! these traits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

// ============================================================================
// Source documents
// ============================================================================

/// One addressable line of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLine {
    /// Stable row identifier (database row id or line number)
    pub id: u64,
    /// Narrative text of the line
    pub text: String,
}

impl SourceLine {
    pub fn new(id: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

/// A line-addressed source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub id: String,
    pub lines: Vec<SourceLine>,
}

impl SourceDocument {
    /// Build a document from plain text, numbering lines from 1.
    pub fn from_text(id: impl Into<String>, text: &str) -> Self {
        let lines = text
            .lines()
            .enumerate()
            .map(|(idx, line)| SourceLine::new(idx as u64 + 1, line))
            .collect();
        Self {
            id: id.into(),
            lines,
        }
    }

    /// True when no line carries any non-whitespace text.
    pub fn is_blank(&self) -> bool {
        self.lines.iter().all(|l| l.text.trim().is_empty())
    }
}

/// Sparse per-line annotations keyed by `SourceLine::id`.
pub type AnnotationOverlay = BTreeMap<u64, String>;

// ============================================================================
// Step executions
// ============================================================================

/// Lifecycle status of a multi-step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    /// Completed, failed and cancelled are terminal; only completed cannot be resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(StepStatus::Pending),
            "in_progress" => Some(StepStatus::InProgress),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            "cancelled" => Some(StepStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of a multi-step execution.
///
/// `current_step` counts completed steps: `0` means nothing has been
/// approved yet, `max_step` means every step is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub id: String,
    pub title: String,
    pub current_step: u32,
    pub max_step: u32,
    pub status: StepStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn new(id: impl Into<String>, title: impl Into<String>, max_step: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            current_step: 0,
            max_step,
            status: StepStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.current_step >= self.max_step
    }

    /// Record that the step after `current_step` was approved.
    ///
    /// The cursor never moves backward and never passes `max_step`.
    pub fn advance(&mut self) {
        if self.current_step < self.max_step {
            self.current_step += 1;
        }
        self.updated_at = Utc::now();
    }

    pub fn mark(&mut self, status: StepStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
        } else {
            self.completed_at = None;
        }
    }
}

// ============================================================================
// Store traits
// ============================================================================

/// Storage for step execution records.
#[async_trait]
pub trait StepExecutionStore: Send + Sync {
    async fn load(&self, id: &str) -> CoreResult<Option<StepExecution>>;

    /// Insert or replace the record.
    async fn save(&self, execution: &StepExecution) -> CoreResult<()>;
}

/// Storage for annotation overlays produced by deterministic pipelines.
#[async_trait]
pub trait OverlayStore: Send + Sync {
    async fn save_overlay(&self, document_id: &str, overlay: &AnnotationOverlay) -> CoreResult<()>;

    async fn load_overlay(&self, document_id: &str) -> CoreResult<Option<AnnotationOverlay>>;
}

/// Storage for source documents and the documents pipelines produce.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load_document(&self, id: &str) -> CoreResult<Option<SourceDocument>>;

    /// Insert or replace the whole document.
    async fn save_document(&self, document: &SourceDocument) -> CoreResult<()>;
}
