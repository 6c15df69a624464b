//! Resilient Executor Integration Tests
//!
//! Verifies attempt budgets, corrective retries and fallback escalation
//! against scripted generation targets.

use std::sync::Arc;

use story_pipeline::services::execution::{
    ChunkExecutionOutcome, ExecutorPolicy, FailureClass, GenerationRequest, LengthRatioValidator,
    NonEmptyValidator, ResilientExecutor, ValidatorSet,
};
use story_pipeline_llm::LlmError;
use tokio_util::sync::CancellationToken;

use crate::support::{chain, fast_policy, ScriptedProvider};

fn request() -> GenerationRequest {
    GenerationRequest::new(0, "The storm rolled in over the hills.", "Rewrite this passage.")
}

fn validators() -> ValidatorSet {
    ValidatorSet::new()
        .with(NonEmptyValidator)
        .with(LengthRatioValidator::new(0.5))
}

#[tokio::test]
async fn test_three_empty_primary_replies_then_fallback_succeeds() {
    let primary = Arc::new(ScriptedProvider::new("primary").replies("", 3));
    let fallback = Arc::new(ScriptedProvider::new("fallback-a").reply("Storm clouds rolled over the hills."));
    let chain = chain(&[("primary", primary.clone()), ("fallback-a", fallback.clone())]);

    let execution = ResilientExecutor::new(fast_policy())
        .run(&request(), &chain, &validators(), &CancellationToken::new())
        .await;

    assert_eq!(execution.outcome.output(), Some("Storm clouds rolled over the hills."));
    assert_eq!(execution.outcome.target(), Some("fallback-a"));
    assert!(execution.outcome.used_fallback());
    assert_eq!(primary.calls(), 3);
    assert_eq!(fallback.calls(), 1);

    assert_eq!(execution.log.attempts_for("primary"), 3);
    assert!(execution.log.attempts[..3]
        .iter()
        .all(|a| a.failure_class == Some(FailureClass::EmptyOutput)));
    assert_eq!(execution.log.successful_target.as_deref(), Some("fallback-a"));
}

#[tokio::test]
async fn test_fallbacks_run_in_declared_order_with_own_budget() {
    let primary = Arc::new(ScriptedProvider::new("primary"));
    let first = Arc::new(ScriptedProvider::new("first"));
    let second = Arc::new(ScriptedProvider::new("second").always("Storm clouds rolled over the hills."));
    let third = Arc::new(ScriptedProvider::new("third").always("never reached, never reached"));
    let chain = chain(&[
        ("primary", primary.clone()),
        ("first", first.clone()),
        ("second", second.clone()),
        ("third", third.clone()),
    ]);

    let execution = ResilientExecutor::new(fast_policy())
        .run(&request(), &chain, &validators(), &CancellationToken::new())
        .await;

    assert_eq!(primary.calls(), 3);
    assert_eq!(first.calls(), 2);
    assert_eq!(second.calls(), 1);
    assert_eq!(third.calls(), 0);
    assert_eq!(execution.outcome.target(), Some("second"));
    assert_eq!(execution.log.targets_tried(), vec!["primary", "first", "second"]);
}

#[tokio::test]
async fn test_validation_failure_resends_original_request_with_correction() {
    let primary = Arc::new(
        ScriptedProvider::new("primary")
            .reply("Short.")
            .reply("The storm rolled in over the green hills."),
    );
    let chain = chain(&[("primary", primary.clone())]);

    let execution = ResilientExecutor::new(fast_policy())
        .run(&request(), &chain, &validators(), &CancellationToken::new())
        .await;
    assert!(matches!(execution.outcome, ChunkExecutionOutcome::Succeeded { .. }));

    let conversations = primary.conversations();
    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[0].len(), 1);
    let retried = &conversations[1];
    assert_eq!(retried.len(), 2);
    assert_eq!(retried[0].content, "Rewrite this passage.");
    assert!(retried[1].content.contains("length_ratio"));
    assert!(!retried.iter().any(|m| m.content.contains("Short.")));
}

#[tokio::test]
async fn test_all_targets_exhausted_reports_last_reason() {
    let primary = Arc::new(ScriptedProvider::new("primary").always("x"));
    let fallback = Arc::new(ScriptedProvider::new("fallback").always("y"));
    let chain = chain(&[("primary", primary.clone()), ("fallback", fallback.clone())]);

    let execution = ResilientExecutor::new(fast_policy())
        .run(&request(), &chain, &validators(), &CancellationToken::new())
        .await;

    match execution.outcome {
        ChunkExecutionOutcome::Failed { reason, attempt, diagnostic } => {
            assert!(reason.contains("length_ratio"));
            let attempt = attempt.unwrap();
            assert_eq!(attempt.target, "fallback");
            assert!(attempt.used_fallback);
            assert!(diagnostic.is_none());
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(primary.calls() + fallback.calls(), 5);
    assert!(!execution.log.overall_success);
}

#[tokio::test]
async fn test_fatal_error_skips_to_next_target() {
    let primary = Arc::new(ScriptedProvider::new("primary").fail(LlmError::AuthenticationFailed {
        message: "bad key".into(),
    }));
    let fallback = Arc::new(ScriptedProvider::new("fallback").always("Storm clouds rolled over the hills."));
    let chain = chain(&[("primary", primary.clone()), ("fallback", fallback.clone())]);

    let execution = ResilientExecutor::new(fast_policy())
        .run(&request(), &chain, &validators(), &CancellationToken::new())
        .await;

    assert_eq!(primary.calls(), 1);
    assert_eq!(execution.outcome.target(), Some("fallback"));
    assert_eq!(execution.log.attempts[0].failure_class, Some(FailureClass::Fatal));
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_back_off_then_succeed() {
    let primary = Arc::new(
        ScriptedProvider::new("primary")
            .fail(LlmError::NetworkError { message: "reset".into() })
            .fail(LlmError::Timeout { message: "slow".into() })
            .reply("The storm rolled in over the hills again."),
    );
    let chain = chain(&[("primary", primary.clone())]);
    let policy = ExecutorPolicy {
        backoff_base_ms: 2000,
        ..ExecutorPolicy::default()
    };

    let started = tokio::time::Instant::now();
    let execution = ResilientExecutor::new(policy)
        .run(&request(), &chain, &validators(), &CancellationToken::new())
        .await;

    assert_eq!(execution.outcome.target(), Some("primary"));
    assert_eq!(primary.calls(), 3);
    // 2s after the first attempt, 4s after the second
    assert!(started.elapsed() >= std::time::Duration::from_secs(6));
}

#[tokio::test]
async fn test_cancelled_before_first_attempt() {
    let primary = Arc::new(ScriptedProvider::new("primary").always("anything at all here"));
    let chain = chain(&[("primary", primary.clone())]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let execution = ResilientExecutor::new(fast_policy())
        .run(&request(), &chain, &validators(), &cancel)
        .await;

    assert_eq!(execution.outcome, ChunkExecutionOutcome::Cancelled);
    assert_eq!(primary.calls(), 0);
}

#[tokio::test]
async fn test_diagnostic_call_never_changes_outcome() {
    let primary = Arc::new(ScriptedProvider::new("primary").replies("", 3).reply("the model explains"));
    let chain = chain(&[("primary", primary.clone())]);
    let policy = ExecutorPolicy {
        capture_diagnostics: true,
        ..fast_policy()
    };

    let execution = ResilientExecutor::new(policy)
        .run(&request(), &chain, &validators(), &CancellationToken::new())
        .await;

    match execution.outcome {
        ChunkExecutionOutcome::Failed { diagnostic, .. } => {
            assert_eq!(diagnostic.as_deref(), Some("the model explains"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(primary.calls(), 4);
}
