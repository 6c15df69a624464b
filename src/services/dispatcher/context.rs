//! Job Context
//!
//! Everything a job's work may touch, passed in explicitly: its identity,
//! cancellation signal, progress sink and a handle back to the dispatcher
//! for step updates and follow-on jobs.

use std::sync::Arc;

use story_pipeline_core::{ProgressLevel, ProgressSink};
use tokio_util::sync::CancellationToken;

use super::TaskDispatcher;
use crate::models::job::JobMetadata;

/// Per-job context handed to the work function
#[derive(Clone)]
pub struct JobContext {
    run_id: String,
    operation: String,
    scope: String,
    metadata: Arc<JobMetadata>,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
    dispatcher: TaskDispatcher,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("run_id", &self.run_id)
            .field("operation", &self.operation)
            .field("scope", &self.scope)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl JobContext {
    pub(crate) fn new(
        run_id: String,
        operation: String,
        scope: String,
        metadata: Arc<JobMetadata>,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressSink>,
        dispatcher: TaskDispatcher,
    ) -> Self {
        Self {
            run_id,
            operation,
            scope,
            metadata,
            cancel,
            progress,
            dispatcher,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn metadata(&self) -> &JobMetadata {
        &self.metadata
    }

    /// Metadata value by key
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn progress(&self) -> &Arc<dyn ProgressSink> {
        &self.progress
    }

    /// Handle for step updates and reentrant enqueues
    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// Append a line to this job's progress log
    pub fn log(&self, message: &str, level: ProgressLevel) {
        self.progress.append(&self.run_id, message, level);
    }

    /// Report the step cursor of this job
    pub fn set_step(&self, current: u32, max: u32, description: Option<&str>) {
        // A closed dispatcher only happens during shutdown; the update is moot then.
        let _ = self
            .dispatcher
            .update_step(&self.run_id, current, max, description);
    }
}
