//! Step Orchestrator
//!
//! Resumable multi-step state machine. Each step alternates an executor run
//! and a checker verdict; a rejection re-runs the executor for the same step
//! with the checker's feedback, bounded only by the wall-clock ceiling of the
//! current start/resume call. An approval persists the advanced cursor
//! before the next step begins, so a crash or cancellation resumes from the
//! last approved step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use story_pipeline_core::{ProgressLevel, ProgressSink, StepExecution, StepExecutionStore, StepStatus};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::job::JobOutcome;
use crate::models::settings::StepSettings;
use crate::services::dispatcher::{JobContext, JobFuture};
use crate::utils::error::{AppError, AppResult};

/// What the executor and checker see for the step being run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepContext {
    pub execution_id: String,
    pub title: String,
    /// 1-based number of the step being produced
    pub step: u32,
    pub max_step: u32,
    /// 1-based run of the executor for this step within the current call
    pub attempt: u32,
    /// Checker feedback from the previous rejected run of this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Checker verdict for one executor output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum CheckVerdict {
    Approved,
    Rejected { feedback: String },
}

impl CheckVerdict {
    pub fn rejected(feedback: impl Into<String>) -> Self {
        CheckVerdict::Rejected {
            feedback: feedback.into(),
        }
    }
}

/// Produces the output of one step
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> AppResult<String>;
}

/// Approves or rejects one executor output
#[async_trait]
pub trait StepChecker: Send + Sync {
    async fn check(&self, ctx: &StepContext, output: &str) -> AppResult<CheckVerdict>;
}

/// How a single step ended
enum StepRun {
    Approved,
    Cancelled,
    TimedOut,
}

/// Step Orchestrator
pub struct StepOrchestrator {
    store: Arc<dyn StepExecutionStore>,
    executor: Arc<dyn StepExecutor>,
    checker: Arc<dyn StepChecker>,
    progress: Arc<dyn ProgressSink>,
    settings: StepSettings,
}

impl StepOrchestrator {
    pub fn new(
        store: Arc<dyn StepExecutionStore>,
        executor: Arc<dyn StepExecutor>,
        checker: Arc<dyn StepChecker>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            store,
            executor,
            checker,
            progress,
            settings: StepSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: StepSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    /// Persist a new pending execution and return its id.
    pub async fn start_step_execution(
        &self,
        title: impl Into<String>,
        max_step: u32,
    ) -> AppResult<String> {
        if max_step == 0 {
            return Err(AppError::validation("a step execution needs at least one step"));
        }
        let execution = StepExecution::new(Uuid::new_v4().to_string(), title, max_step);
        self.store.save(&execution).await?;
        info!(
            execution_id = %execution.id,
            max_step,
            "step execution created"
        );
        Ok(execution.id)
    }

    /// Drive an execution from its persisted cursor to a terminal status.
    ///
    /// A completed execution is returned as-is; failed and cancelled ones
    /// re-enter `in_progress` and continue from their last approved step.
    pub async fn resume_step_execution(
        &self,
        execution_id: &str,
        cancel: &CancellationToken,
    ) -> AppResult<StepStatus> {
        self.drive(execution_id, cancel, None).await
    }

    /// Adapt an execution into dispatcher work. The job's cancellation
    /// token stops the execution and its step cursor is mirrored to the job.
    pub fn job(
        self: &Arc<Self>,
        execution_id: impl Into<String>,
    ) -> impl FnOnce(JobContext) -> JobFuture + Send + 'static {
        let orchestrator = Arc::clone(self);
        let execution_id = execution_id.into();
        move |ctx: JobContext| -> JobFuture {
            Box::pin(async move {
                let result = orchestrator
                    .drive(&execution_id, ctx.cancellation_token(), Some(&ctx))
                    .await;
                match result {
                    Ok(StepStatus::Completed) => {
                        JobOutcome::completed_with(format!("step execution {} completed", execution_id))
                    }
                    Ok(StepStatus::Cancelled) => JobOutcome::Cancelled,
                    Ok(status) => {
                        let reason = match orchestrator.store.load(&execution_id).await {
                            Ok(Some(exec)) => exec.error,
                            _ => None,
                        };
                        JobOutcome::failed(reason.unwrap_or_else(|| {
                            format!("step execution {} ended {}", execution_id, status)
                        }))
                    }
                    Err(e) => JobOutcome::failed(e.to_string()),
                }
            })
        }
    }

    async fn drive(
        &self,
        execution_id: &str,
        cancel: &CancellationToken,
        job: Option<&JobContext>,
    ) -> AppResult<StepStatus> {
        let mut exec = self
            .store
            .load(execution_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("step execution '{}'", execution_id)))?;

        if exec.status == StepStatus::Completed {
            debug!(execution_id = %execution_id, "step execution already completed");
            return Ok(StepStatus::Completed);
        }

        match self.run_steps(&mut exec, cancel, job).await {
            Ok(status) => Ok(status),
            Err(e) => {
                self.abandon(&mut exec, &e).await;
                Err(e)
            }
        }
    }

    /// Advance from the persisted cursor until a terminal status. Store
    /// errors are returned without a terminal transition.
    async fn run_steps(
        &self,
        exec: &mut StepExecution,
        cancel: &CancellationToken,
        job: Option<&JobContext>,
    ) -> AppResult<StepStatus> {
        let execution_id = exec.id.clone();
        exec.mark(StepStatus::InProgress, None);
        self.store.save(exec).await?;
        info!(
            execution_id = %execution_id,
            current_step = exec.current_step,
            max_step = exec.max_step,
            "step execution running"
        );

        let deadline = Instant::now() + Duration::from_secs(self.settings.wall_clock_limit_secs);

        loop {
            if exec.is_finished() {
                return self.finish(exec, StepStatus::Completed, None).await;
            }
            if cancel.is_cancelled() {
                return self.finish(exec, StepStatus::Cancelled, None).await;
            }

            let step = exec.current_step + 1;
            let description = format!("{}: step {}/{}", exec.title, step, exec.max_step);
            self.report_step(exec, &description, job);

            match self.run_step(exec, step, cancel, deadline).await {
                Ok(StepRun::Approved) => {
                    exec.advance();
                    self.store.save(exec).await?;
                    debug!(
                        execution_id = %execution_id,
                        current_step = exec.current_step,
                        "step approved"
                    );
                }
                Ok(StepRun::Cancelled) => {
                    return self.finish(exec, StepStatus::Cancelled, None).await;
                }
                Ok(StepRun::TimedOut) => {
                    let reason = format!(
                        "wall-clock limit of {}s exceeded at step {}",
                        self.settings.wall_clock_limit_secs, step
                    );
                    return self.finish(exec, StepStatus::Failed, Some(reason)).await;
                }
                Err(e) => {
                    return self
                        .finish(exec, StepStatus::Failed, Some(e.to_string()))
                        .await;
                }
            }
        }
    }

    /// Run executor and checker for one step until approval.
    async fn run_step(
        &self,
        exec: &StepExecution,
        step: u32,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> AppResult<StepRun> {
        let mut ctx = StepContext {
            execution_id: exec.id.clone(),
            title: exec.title.clone(),
            step,
            max_step: exec.max_step,
            attempt: 1,
            feedback: None,
        };

        loop {
            let round = async {
                let output = self.executor.execute(&ctx).await?;
                self.checker.check(&ctx, &output).await
            };

            let verdict = tokio::select! {
                _ = cancel.cancelled() => return Ok(StepRun::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Ok(StepRun::TimedOut),
                verdict = round => verdict?,
            };

            match verdict {
                CheckVerdict::Approved => return Ok(StepRun::Approved),
                CheckVerdict::Rejected { feedback } => {
                    warn!(
                        execution_id = %ctx.execution_id,
                        step,
                        attempt = ctx.attempt,
                        feedback = %feedback,
                        "step rejected by checker"
                    );
                    self.progress.append(
                        &ctx.execution_id,
                        &format!("Step {} rejected: {}", step, feedback),
                        ProgressLevel::Warning,
                    );
                    ctx.attempt += 1;
                    ctx.feedback = Some(feedback);

                    if self.settings.rejection_delay_ms > 0 {
                        let delay = Duration::from_millis(self.settings.rejection_delay_ms);
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(StepRun::Cancelled),
                            _ = tokio::time::sleep_until(deadline) => return Ok(StepRun::TimedOut),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    /// Best-effort failed transition after an error escaped the step loop.
    async fn abandon(&self, exec: &mut StepExecution, err: &AppError) {
        let reason = err.to_string();
        exec.mark(StepStatus::Failed, Some(reason.clone()));
        if let Err(save_err) = self.store.save(exec).await {
            warn!(
                execution_id = %exec.id,
                error = %save_err,
                "could not persist failed status"
            );
        }
        warn!(execution_id = %exec.id, current_step = exec.current_step, error = %reason, "step execution failed");
        self.progress.append(&exec.id, &reason, ProgressLevel::Error);
        self.progress
            .broadcast_step_progress(&exec.id, exec.current_step, exec.max_step, None);
        self.progress
            .broadcast_completion(&exec.id, StepStatus::Failed.as_str());
    }

    fn report_step(&self, exec: &StepExecution, description: &str, job: Option<&JobContext>) {
        self.progress.broadcast_step_progress(
            &exec.id,
            exec.current_step,
            exec.max_step,
            Some(description),
        );
        if let Some(ctx) = job {
            ctx.set_step(exec.current_step, exec.max_step, Some(description));
        }
    }

    async fn finish(
        &self,
        exec: &mut StepExecution,
        status: StepStatus,
        error: Option<String>,
    ) -> AppResult<StepStatus> {
        exec.mark(status, error);
        self.store.save(exec).await?;

        match status {
            StepStatus::Failed => {
                let reason = exec.error.as_deref().unwrap_or("unknown error");
                warn!(execution_id = %exec.id, current_step = exec.current_step, error = %reason, "step execution failed");
                self.progress.append(&exec.id, reason, ProgressLevel::Error);
            }
            _ => {
                info!(
                    execution_id = %exec.id,
                    current_step = exec.current_step,
                    status = %status,
                    "step execution finished"
                );
            }
        }
        self.progress
            .broadcast_step_progress(&exec.id, exec.current_step, exec.max_step, None);
        self.progress.broadcast_completion(&exec.id, status.as_str());
        Ok(status)
    }
}
