//! Task Dispatcher Integration Tests
//!
//! Scope ordering, priorities, dedup, concurrency limits, reentrant
//! enqueue and progress publication through the public handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use story_pipeline::models::job::{JobOutcome, JobStatus};
use story_pipeline::models::settings::DispatcherSettings;
use story_pipeline::services::dispatcher::{
    DispatchError, EnqueueOutcome, EnqueueRequest, OperationRegistry, TaskDispatcher,
};
use story_pipeline::services::progress::{ChannelProgressSink, ProgressEvent};
use story_pipeline_core::NoopProgressSink;
use tokio::sync::{oneshot, Notify};

fn dispatcher(max_concurrency: usize) -> TaskDispatcher {
    TaskDispatcher::spawn(
        DispatcherSettings {
            max_concurrency,
            ..DispatcherSettings::default()
        },
        Arc::new(NoopProgressSink),
    )
}

/// Enqueue a job that holds its scope until `release` is notified.
async fn enqueue_blocker(
    dispatcher: &TaskDispatcher,
    request: EnqueueRequest,
    release: Arc<Notify>,
) -> String {
    let (started_tx, started_rx) = oneshot::channel();
    let outcome = dispatcher
        .enqueue(request, move |_ctx| async move {
            let _ = started_tx.send(());
            release.notified().await;
            JobOutcome::completed()
        })
        .await
        .unwrap();
    started_rx.await.unwrap();
    outcome.run_id().to_string()
}

#[tokio::test]
async fn test_lower_priority_value_runs_first_within_scope() {
    let dispatcher = dispatcher(4);
    let release = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let blocker = enqueue_blocker(
        &dispatcher,
        EnqueueRequest::new("block").with_scope("doc-1"),
        release.clone(),
    )
    .await;

    let mut ids = Vec::new();
    for (label, priority) in [("b", 2), ("a", 1)] {
        let order = order.clone();
        let outcome = dispatcher
            .enqueue(
                EnqueueRequest::new(label)
                    .with_scope("doc-1")
                    .with_priority(priority),
                move |ctx| async move {
                    order.lock().unwrap().push(ctx.operation().to_string());
                    JobOutcome::completed()
                },
            )
            .await
            .unwrap();
        ids.push(outcome.run_id().to_string());
    }

    let active = dispatcher.get_active_jobs().await.unwrap();
    assert_eq!(active.len(), 3);
    assert_eq!(active[0].run_id, blocker);
    assert!(active[1..].iter().all(|j| j.status == JobStatus::Queued));

    release.notify_one();
    for id in &ids {
        dispatcher.wait_for(id).await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_same_scope_jobs_never_overlap() {
    let dispatcher = dispatcher(4);
    let in_scope = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for _ in 0..4 {
        let in_scope = in_scope.clone();
        let peak = peak.clone();
        let outcome = dispatcher
            .enqueue(EnqueueRequest::new("work").with_scope("doc-1"), move |_ctx| async move {
                let now = in_scope.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_scope.fetch_sub(1, Ordering::SeqCst);
                JobOutcome::completed()
            })
            .await
            .unwrap();
        ids.push(outcome.run_id().to_string());
    }

    for id in &ids {
        assert_eq!(dispatcher.wait_for(id).await.unwrap().status, JobStatus::Completed);
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrency_limit_across_scopes() {
    let dispatcher = dispatcher(2);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for n in 0..6 {
        let running = running.clone();
        let peak = peak.clone();
        let outcome = dispatcher
            .enqueue(
                EnqueueRequest::new("work").with_scope(format!("doc-{}", n)),
                move |_ctx| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    JobOutcome::completed()
                },
            )
            .await
            .unwrap();
        ids.push(outcome.run_id().to_string());
    }

    for id in &ids {
        dispatcher.wait_for(id).await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_dedup_key_suppresses_while_active() {
    let dispatcher = dispatcher(4);
    let release = Arc::new(Notify::new());
    let request = || {
        EnqueueRequest::new("tag_document")
            .with_scope("doc-1")
            .with_metadata("documentId", "doc-1")
            .dedup_on(["documentId"])
    };

    let first = enqueue_blocker(&dispatcher, request(), release.clone()).await;
    let second = dispatcher
        .enqueue(request(), |_ctx| async { JobOutcome::completed() })
        .await
        .unwrap();

    assert_eq!(
        second,
        EnqueueOutcome::Suppressed {
            existing_run_id: first.clone()
        }
    );
    assert_eq!(dispatcher.get_active_jobs().await.unwrap().len(), 1);

    release.notify_one();
    dispatcher.wait_for(&first).await.unwrap();

    // Once the first job is finished the key is free again.
    let third = dispatcher
        .enqueue(request(), |_ctx| async { JobOutcome::completed() })
        .await
        .unwrap();
    assert!(!third.is_suppressed());
    assert_ne!(third.run_id(), first);
}

#[tokio::test]
async fn test_duplicate_run_id_rejected_against_history() {
    let dispatcher = dispatcher(4);
    let request = || EnqueueRequest::new("work").with_run_id("run-1");

    let first = dispatcher
        .enqueue(request(), |_ctx| async { JobOutcome::completed() })
        .await
        .unwrap();
    dispatcher.wait_for(first.run_id()).await.unwrap();

    let err = dispatcher
        .enqueue(request(), |_ctx| async { JobOutcome::completed() })
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::DuplicateRunId("run-1".into()));
}

#[tokio::test]
async fn test_unregistered_operation_and_batch() {
    let mut registry = OperationRegistry::new();
    registry.register_fn("echo", |ctx| async move {
        JobOutcome::completed_with(ctx.meta("text").unwrap_or_default().to_string())
    });
    let dispatcher = TaskDispatcher::spawn_with_registry(
        DispatcherSettings::default(),
        Arc::new(NoopProgressSink),
        registry,
    );

    let results = dispatcher
        .enqueue_batch(vec![
            EnqueueRequest::new("echo").with_metadata("text", "hello"),
            EnqueueRequest::new("missing"),
        ])
        .await;
    assert_eq!(results.len(), 2);
    assert_eq!(
        results[1],
        Err(DispatchError::NotImplemented("missing".into()))
    );

    let run_id = results[0].as_ref().unwrap().run_id().to_string();
    let done = dispatcher.wait_for(&run_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.message.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_job_can_enqueue_follow_on_without_deadlock() {
    let dispatcher = dispatcher(1);
    let (child_tx, child_rx) = oneshot::channel();

    let parent = dispatcher
        .enqueue(EnqueueRequest::new("parent").with_scope("doc-1"), move |ctx| async move {
            let child = ctx
                .dispatcher()
                .enqueue(
                    EnqueueRequest::new("child").with_scope(ctx.scope()),
                    |_ctx| async { JobOutcome::completed_with("child done") },
                )
                .await;
            match child {
                Ok(outcome) => {
                    let _ = child_tx.send(outcome.run_id().to_string());
                    JobOutcome::completed()
                }
                Err(e) => JobOutcome::failed(e.to_string()),
            }
        })
        .await
        .unwrap();

    let parent = tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_for(parent.run_id()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.status, JobStatus::Completed);

    let child_id = child_rx.await.unwrap();
    let child = tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_for(&child_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.message.as_deref(), Some("child done"));
}

#[tokio::test]
async fn test_cancel_queued_and_running_jobs() {
    let dispatcher = dispatcher(4);
    let (started_tx, started_rx) = oneshot::channel();

    let running = dispatcher
        .enqueue(EnqueueRequest::new("long").with_scope("doc-1"), move |ctx| async move {
            let _ = started_tx.send(());
            ctx.cancellation_token().cancelled().await;
            JobOutcome::failed("interrupted")
        })
        .await
        .unwrap();
    started_rx.await.unwrap();

    let queued = dispatcher
        .enqueue(EnqueueRequest::new("next").with_scope("doc-1"), |_ctx| async {
            JobOutcome::completed()
        })
        .await
        .unwrap();

    assert!(dispatcher.cancel(queued.run_id()).await.unwrap());
    let queued = dispatcher.wait_for(queued.run_id()).await.unwrap();
    assert_eq!(queued.status, JobStatus::Cancelled);
    assert!(queued.started_at.is_none());

    assert!(dispatcher.cancel(running.run_id()).await.unwrap());
    let running = dispatcher.wait_for(running.run_id()).await.unwrap();
    assert_eq!(running.status, JobStatus::Cancelled);

    // Already finished
    assert!(!dispatcher.cancel(running.run_id.as_str()).await.unwrap());
    assert!(!dispatcher.cancel("nope").await.unwrap());
}

#[tokio::test]
async fn test_status_history_and_step_updates() {
    let dispatcher = dispatcher(4);
    let outcome = dispatcher
        .enqueue(
            EnqueueRequest::new("steps").with_max_step(3),
            |ctx| async move {
                for step in 1..=3 {
                    ctx.set_step(step, 3, Some("working"));
                }
                JobOutcome::completed_with("all steps")
            },
        )
        .await
        .unwrap();

    let done = dispatcher.wait_for(outcome.run_id()).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.finished_at.is_some());

    let status = dispatcher.job_status(outcome.run_id()).await.unwrap().unwrap();
    assert_eq!(status.message.as_deref(), Some("all steps"));
    assert_eq!(status.current_step, 3);
    assert!(dispatcher.job_status("unknown").await.unwrap().is_none());
    assert!(dispatcher.get_active_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_events_reach_subscribers() {
    let sink = Arc::new(ChannelProgressSink::new(64));
    let mut events = sink.subscribe();
    let dispatcher = TaskDispatcher::spawn(DispatcherSettings::default(), sink.clone());

    let outcome = dispatcher
        .enqueue(EnqueueRequest::new("noisy").with_run_id("run-7"), |ctx| async move {
            ctx.log("halfway", story_pipeline_core::ProgressLevel::Info);
            JobOutcome::completed()
        })
        .await
        .unwrap();
    dispatcher.wait_for(outcome.run_id()).await.unwrap();

    let mut saw_log = false;
    let mut completed_status = None;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.id(), "run-7");
        match event {
            ProgressEvent::Log { message, .. } if message == "halfway" => saw_log = true,
            ProgressEvent::Completed { status, .. } => completed_status = Some(status),
            _ => {}
        }
    }
    assert!(saw_log);
    assert_eq!(completed_status.as_deref(), Some("completed"));
}

#[tokio::test]
async fn test_shutdown_cancels_and_rejects() {
    let dispatcher = dispatcher(4);
    let (started_tx, started_rx) = oneshot::channel();
    dispatcher
        .enqueue(EnqueueRequest::new("long"), move |ctx| async move {
            let _ = started_tx.send(());
            ctx.cancellation_token().cancelled().await;
            JobOutcome::Cancelled
        })
        .await
        .unwrap();
    started_rx.await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), dispatcher.shutdown())
        .await
        .unwrap();

    let err = dispatcher
        .enqueue(EnqueueRequest::new("late"), |_ctx| async { JobOutcome::completed() })
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::DispatcherClosed);
}
