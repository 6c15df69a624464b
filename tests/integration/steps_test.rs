//! Step Orchestrator Integration Tests
//!
//! Resume-after-cancel against the SQLite store and step executions run
//! as dispatcher jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use story_pipeline::models::job::JobStatus;
use story_pipeline::models::settings::DispatcherSettings;
use story_pipeline::services::dispatcher::{EnqueueRequest, TaskDispatcher};
use story_pipeline::services::steps::{
    CheckVerdict, StepChecker, StepContext, StepExecutor, StepOrchestrator,
};
use story_pipeline::storage::Database;
use story_pipeline::AppResult;
use story_pipeline_core::{NoopProgressSink, StepExecutionStore, StepStatus};
use tokio_util::sync::CancellationToken;

/// Records which step each executor run produced
#[derive(Default)]
struct RecordingExecutor {
    runs: Mutex<Vec<(u32, u32)>>,
}

impl RecordingExecutor {
    fn steps(&self) -> Vec<u32> {
        self.runs.lock().unwrap().iter().map(|(step, _)| *step).collect()
    }
}

#[async_trait]
impl StepExecutor for RecordingExecutor {
    async fn execute(&self, ctx: &StepContext) -> AppResult<String> {
        self.runs.lock().unwrap().push((ctx.step, ctx.attempt));
        Ok(format!("output for step {}", ctx.step))
    }
}

/// Approves everything except the first check of `interrupt_at`, where it
/// cancels the token and never answers.
struct InterruptingChecker {
    interrupt_at: u32,
    token: CancellationToken,
    fired: AtomicBool,
}

#[async_trait]
impl StepChecker for InterruptingChecker {
    async fn check(&self, ctx: &StepContext, _output: &str) -> AppResult<CheckVerdict> {
        if ctx.step == self.interrupt_at && !self.fired.swap(true, Ordering::SeqCst) {
            self.token.cancel();
            std::future::pending::<()>().await;
        }
        Ok(CheckVerdict::Approved)
    }
}

struct ApproveAll;

#[async_trait]
impl StepChecker for ApproveAll {
    async fn check(&self, _ctx: &StepContext, _output: &str) -> AppResult<CheckVerdict> {
        Ok(CheckVerdict::Approved)
    }
}

#[tokio::test]
async fn test_cancel_mid_step_then_resume_from_same_step() {
    let database = Database::new_in_memory().unwrap();
    let token = CancellationToken::new();
    let executor = Arc::new(RecordingExecutor::default());
    let checker = Arc::new(InterruptingChecker {
        interrupt_at: 2,
        token: token.clone(),
        fired: AtomicBool::new(false),
    });
    let orchestrator = StepOrchestrator::new(
        Arc::new(database.clone()),
        executor.clone(),
        checker,
        Arc::new(NoopProgressSink),
    );

    let id = orchestrator.start_step_execution("chapter", 4).await.unwrap();
    assert_eq!(database.list_resumable_step_executions().unwrap(), vec![id.clone()]);

    let status = orchestrator.resume_step_execution(&id, &token).await.unwrap();
    assert_eq!(status, StepStatus::Cancelled);

    let saved = database.get_step_execution(&id).unwrap().unwrap();
    assert_eq!(saved.status, StepStatus::Cancelled);
    assert_eq!(saved.current_step, 1);
    assert!(database.list_resumable_step_executions().unwrap().contains(&id));

    let status = orchestrator
        .resume_step_execution(&id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status, StepStatus::Completed);
    assert_eq!(executor.steps(), vec![1, 2, 2, 3, 4]);

    let saved = database.load(&id).await.unwrap().unwrap();
    assert_eq!(saved.current_step, 4);
    assert!(saved.completed_at.is_some());
    assert!(database.list_resumable_step_executions().unwrap().is_empty());
}

#[tokio::test]
async fn test_completed_execution_is_not_rerun() {
    let database = Database::new_in_memory().unwrap();
    let executor = Arc::new(RecordingExecutor::default());
    let orchestrator = StepOrchestrator::new(
        Arc::new(database.clone()),
        executor.clone(),
        Arc::new(ApproveAll),
        Arc::new(NoopProgressSink),
    );

    let id = orchestrator.start_step_execution("short", 2).await.unwrap();
    let cancel = CancellationToken::new();
    assert_eq!(
        orchestrator.resume_step_execution(&id, &cancel).await.unwrap(),
        StepStatus::Completed
    );
    assert_eq!(
        orchestrator.resume_step_execution(&id, &cancel).await.unwrap(),
        StepStatus::Completed
    );
    assert_eq!(executor.steps(), vec![1, 2]);
}

#[tokio::test]
async fn test_step_execution_runs_as_dispatcher_job() {
    let database = Database::new_in_memory().unwrap();
    let executor = Arc::new(RecordingExecutor::default());
    let orchestrator = Arc::new(StepOrchestrator::new(
        Arc::new(database.clone()),
        executor.clone(),
        Arc::new(ApproveAll),
        Arc::new(NoopProgressSink),
    ));
    let dispatcher = TaskDispatcher::spawn(DispatcherSettings::default(), Arc::new(NoopProgressSink));

    let id = orchestrator.start_step_execution("outline", 3).await.unwrap();
    let outcome = dispatcher
        .enqueue(
            EnqueueRequest::new("step_execution")
                .with_scope(id.clone())
                .with_max_step(3),
            orchestrator.job(id.clone()),
        )
        .await
        .unwrap();

    let done = dispatcher.wait_for(outcome.run_id()).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(
        done.message,
        Some(format!("step execution {} completed", id))
    );
    assert_eq!(executor.steps(), vec![1, 2, 3]);
    assert_eq!(
        database.get_step_execution(&id).unwrap().unwrap().status,
        StepStatus::Completed
    );
}

#[tokio::test]
async fn test_unknown_execution_fails_the_job() {
    let orchestrator = Arc::new(StepOrchestrator::new(
        Arc::new(Database::new_in_memory().unwrap()),
        Arc::new(RecordingExecutor::default()),
        Arc::new(ApproveAll),
        Arc::new(NoopProgressSink),
    ));
    let dispatcher = TaskDispatcher::spawn(DispatcherSettings::default(), Arc::new(NoopProgressSink));

    let outcome = dispatcher
        .enqueue(EnqueueRequest::new("step_execution"), orchestrator.job("missing"))
        .await
        .unwrap();
    let done = dispatcher.wait_for(outcome.run_id()).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.message.unwrap().contains("missing"));
}
