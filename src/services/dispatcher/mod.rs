//! Task Dispatcher
//!
//! Priority- and scope-aware background job runner.
//!
//! - Jobs sharing a scope run one at a time, lowest priority value first
//! - Different scopes run concurrently up to `max_concurrency`
//! - Jobs may carry a dedup key; an enqueue matching an active job is
//!   suppressed and returns the existing run id
//! - Running jobs receive a [`JobContext`] and may enqueue follow-on jobs
//!   through it without deadlocking the dispatcher
//!
//! The handle is cheap to clone. All state lives in a single scheduling task
//! that owns the job table; handles talk to it over a channel.

mod context;
mod registry;
mod request;
mod scheduler;

pub use context::JobContext;
pub use registry::{FnHandler, JobHandler, OperationRegistry};
pub use request::EnqueueRequest;
pub use scheduler::{JobFuture, JobWork};

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use story_pipeline_core::ProgressSink;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::models::job::{JobOutcome, JobSnapshot, JobStatus};
use crate::models::settings::DispatcherSettings;
use crate::utils::error::AppError;
use scheduler::{Command, PendingJob, Scheduler};

/// Dispatcher errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("run id '{0}' is already in use")]
    DuplicateRunId(String),

    #[error("no handler registered for operation '{0}'")]
    NotImplemented(String),

    #[error("unknown run '{0}'")]
    UnknownRun(String),

    #[error("dispatcher is shut down")]
    DispatcherClosed,
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotImplemented(_) | DispatchError::DuplicateRunId(_) => {
                AppError::validation(err.to_string())
            }
            DispatchError::UnknownRun(_) => AppError::not_found(err.to_string()),
            DispatchError::DispatcherClosed => AppError::internal(err.to_string()),
        }
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The job was queued under this run id
    Enqueued { run_id: String },
    /// An equivalent job is already queued or running
    Suppressed { existing_run_id: String },
}

impl EnqueueOutcome {
    /// Run id that will carry out the work (new or existing)
    pub fn run_id(&self) -> &str {
        match self {
            EnqueueOutcome::Enqueued { run_id } => run_id,
            EnqueueOutcome::Suppressed { existing_run_id } => existing_run_id,
        }
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, EnqueueOutcome::Suppressed { .. })
    }
}

/// Handle to the dispatcher
#[derive(Clone)]
pub struct TaskDispatcher {
    tx: mpsc::UnboundedSender<Command>,
    registry: Arc<OperationRegistry>,
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("registry", &self.registry)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl TaskDispatcher {
    /// Start a dispatcher with no registered operations.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn(settings: DispatcherSettings, progress: Arc<dyn ProgressSink>) -> Self {
        Self::spawn_with_registry(settings, progress, OperationRegistry::new())
    }

    /// Start a dispatcher that can run operations by name.
    pub fn spawn_with_registry(
        settings: DispatcherSettings,
        progress: Arc<dyn ProgressSink>,
        registry: OperationRegistry,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(registry);
        let scheduler = Scheduler::new(settings, progress, tx.downgrade(), registry.clone());
        tokio::spawn(scheduler.run(rx));
        Self { tx, registry }
    }

    pub(crate) fn from_parts(
        tx: mpsc::UnboundedSender<Command>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self { tx, registry }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Queue a job running `work`.
    pub async fn enqueue<F, Fut>(
        &self,
        request: EnqueueRequest,
        work: F,
    ) -> Result<EnqueueOutcome, DispatchError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        let work: JobWork = Box::new(move |ctx| Box::pin(work(ctx)) as JobFuture);
        self.submit(request, work).await
    }

    /// Queue a job by operation name using the registered handler.
    pub async fn enqueue_registered(
        &self,
        request: EnqueueRequest,
    ) -> Result<EnqueueOutcome, DispatchError> {
        let handler = self
            .registry
            .get(&request.operation)
            .ok_or_else(|| DispatchError::NotImplemented(request.operation.clone()))?;
        let work: JobWork = Box::new(move |ctx| Box::pin(async move { handler.run(ctx).await }) as JobFuture);
        self.submit(request, work).await
    }

    /// Queue several registered operations. Each request succeeds or fails
    /// on its own; results are returned in request order.
    pub async fn enqueue_batch(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Vec<Result<EnqueueOutcome, DispatchError>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.enqueue_registered(request).await);
        }
        results
    }

    async fn submit(
        &self,
        request: EnqueueRequest,
        work: JobWork,
    ) -> Result<EnqueueOutcome, DispatchError> {
        let dedup_key = request.dedup_key();
        let run_id = request
            .run_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let scope = request.scope.unwrap_or_else(|| run_id.clone());

        let snapshot = JobSnapshot {
            run_id,
            operation: request.operation,
            scope,
            priority: request.priority,
            metadata: request.metadata,
            dedup_key,
            status: JobStatus::Queued,
            current_step: 0,
            max_step: request.max_step,
            step_description: None,
            message: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let (reply, rx) = oneshot::channel();
        self.send(Command::Enqueue {
            job: PendingJob { snapshot, work },
            reply,
        })?;
        rx.await.map_err(|_| DispatchError::DispatcherClosed)?
    }

    /// Update the step cursor of a queued or running job.
    ///
    /// Fire-and-forget: updates for unknown or finished jobs are dropped.
    pub fn update_step(
        &self,
        run_id: &str,
        current: u32,
        max: u32,
        description: Option<&str>,
    ) -> Result<(), DispatchError> {
        self.send(Command::UpdateStep {
            run_id: run_id.to_string(),
            current,
            max,
            description: description.map(str::to_string),
        })
    }

    /// Snapshots of all queued and running jobs, in enqueue order.
    pub async fn get_active_jobs(&self) -> Result<Vec<JobSnapshot>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ActiveJobs { reply })?;
        rx.await.map_err(|_| DispatchError::DispatcherClosed)
    }

    /// Current or recent snapshot of a job.
    pub async fn job_status(&self, run_id: &str) -> Result<Option<JobSnapshot>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status {
            run_id: run_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| DispatchError::DispatcherClosed)
    }

    /// Request cancellation. Queued jobs are dropped immediately; running
    /// jobs observe it through their context. Returns false when the job
    /// is unknown or already finished.
    pub async fn cancel(&self, run_id: &str) -> Result<bool, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel {
            run_id: run_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| DispatchError::DispatcherClosed)
    }

    /// Wait until a job reaches a terminal status and return its final snapshot.
    pub async fn wait_for(&self, run_id: &str) -> Result<JobSnapshot, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Watch {
            run_id: run_id.to_string(),
            reply,
        })?;
        let mut watcher = rx
            .await
            .map_err(|_| DispatchError::DispatcherClosed)?
            .ok_or_else(|| DispatchError::UnknownRun(run_id.to_string()))?;

        let result = watcher
            .wait_for(|snapshot| snapshot.status.is_terminal())
            .await
            .map(|snapshot| snapshot.clone());
        match result {
            Ok(snapshot) => Ok(snapshot),
            Err(_) => {
                let last = watcher.borrow().clone();
                if last.status.is_terminal() {
                    Ok(last)
                } else {
                    Err(DispatchError::DispatcherClosed)
                }
            }
        }
    }

    /// Cancel everything, reject new work, and wait for running jobs to return.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), DispatchError> {
        self.tx
            .send(command)
            .map_err(|_| DispatchError::DispatcherClosed)
    }
}
