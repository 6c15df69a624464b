//! Pipeline Integration Tests
//!
//! Tagging and narrative pipelines registered on a dispatcher over the
//! SQLite store, with scripted generation targets.

use std::sync::Arc;

use story_pipeline::models::job::JobStatus;
use story_pipeline::models::settings::{DispatcherSettings, PipelineConfig};
use story_pipeline::services::dispatcher::{EnqueueRequest, OperationRegistry, TaskDispatcher};
use story_pipeline::services::execution::{FailureClass, FallbackChain};
use story_pipeline::services::pipeline::{
    NarrativePipeline, TaggingPipeline, DOCUMENT_ID_KEY, OUTPUT_ID_KEY,
};
use story_pipeline::services::progress::{ChannelProgressSink, ProgressEvent};
use story_pipeline::state::{TAG_DOCUMENT_OPERATION, TRANSFORM_NARRATIVE_OPERATION};
use story_pipeline::storage::Database;
use story_pipeline_core::SourceDocument;
use tokio_util::sync::CancellationToken;

use crate::support::{chain, ScriptedProvider};

const STORY: &str = "She opened the door.\nNobody answered.";

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.executor.backoff_base_ms = 0;
    config
}

fn start(
    database: &Database,
    tagging: FallbackChain,
    narrative: FallbackChain,
    sink: Arc<ChannelProgressSink>,
) -> TaskDispatcher {
    let config = config();
    let store = Arc::new(database.clone());

    let mut registry = OperationRegistry::new();
    registry.register(
        TRANSFORM_NARRATIVE_OPERATION,
        Arc::new(NarrativePipeline::new(store.clone(), narrative, &config)),
    );
    registry.register(
        TAG_DOCUMENT_OPERATION,
        Arc::new(
            TaggingPipeline::new(store.clone(), store, tagging, &config)
                .with_follow_on(TRANSFORM_NARRATIVE_OPERATION),
        ),
    );

    TaskDispatcher::spawn_with_registry(DispatcherSettings::default(), sink, registry)
}

fn narrator() -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new("narrator").always("She slowly opened the door. Nobody answered her."))
}

fn tag_request(document_id: &str) -> EnqueueRequest {
    EnqueueRequest::new(TAG_DOCUMENT_OPERATION)
        .with_scope(document_id)
        .with_metadata(DOCUMENT_ID_KEY, document_id)
        .dedup_on([DOCUMENT_ID_KEY])
}

#[tokio::test]
async fn test_tagging_falls_back_and_chains_narrative() {
    let database = Database::new_in_memory().unwrap();
    database
        .put_document(&SourceDocument::from_text("d1", STORY))
        .unwrap();

    let primary = Arc::new(ScriptedProvider::new("primary").replies("", 3));
    let fallback = Arc::new(ScriptedProvider::new("fallback-a").reply("1| [A]\n2| [B]"));
    let sink = Arc::new(ChannelProgressSink::new(1024));
    let mut events = sink.subscribe();
    let dispatcher = start(
        &database,
        chain(&[("primary", primary.clone()), ("fallback-a", fallback.clone())]),
        chain(&[("narrator", narrator())]),
        sink,
    );

    let outcome = dispatcher
        .enqueue_registered(tag_request("d1"))
        .await
        .unwrap();
    let tagged = dispatcher.wait_for(outcome.run_id()).await.unwrap();

    assert_eq!(tagged.status, JobStatus::Completed);
    let message = tagged.message.unwrap();
    assert!(message.contains("2 lines annotated"), "{}", message);
    assert!(message.contains("fallback used: fallback-a"), "{}", message);
    assert_eq!(primary.calls(), 3);
    assert_eq!(fallback.calls(), 1);

    let overlay = database.get_overlay("d1").unwrap().unwrap();
    assert_eq!(overlay.get(&1).map(String::as_str), Some("[A]"));
    assert_eq!(overlay.get(&2).map(String::as_str), Some("[B]"));

    let prefix = format!("Queued {} as ", TRANSFORM_NARRATIVE_OPERATION);
    let mut follow_on = None;
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::Log { message, .. } = event {
            if let Some(id) = message.strip_prefix(&prefix) {
                follow_on = Some(id.to_string());
            }
        }
    }
    let follow_on = follow_on.expect("follow-on job queued");

    let narrated = dispatcher.wait_for(&follow_on).await.unwrap();
    assert_eq!(narrated.status, JobStatus::Completed);
    assert_eq!(narrated.scope, "d1");
    let saved = database.get_document("d1.narrative").unwrap().unwrap();
    assert_eq!(
        saved.lines[0].text,
        "She slowly opened the door. Nobody answered her."
    );
}

#[tokio::test]
async fn test_tagging_report_carries_attempt_log() {
    let database = Database::new_in_memory().unwrap();
    database
        .put_document(&SourceDocument::from_text("d1", STORY))
        .unwrap();
    let store = Arc::new(database.clone());

    let primary = Arc::new(ScriptedProvider::new("primary").replies("", 3));
    let fallback = Arc::new(ScriptedProvider::new("fallback-a").reply("1| [A]\n2| [B]"));
    let pipeline = TaggingPipeline::new(
        store.clone(),
        store,
        chain(&[("primary", primary), ("fallback-a", fallback)]),
        &config(),
    );

    let report = pipeline
        .tag_document("d1", &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.logs.len(), 1);
    let log = &report.logs[0];
    assert_eq!(log.attempts.len(), 4);
    assert_eq!(log.failed_attempts_count(), 3);
    assert!(log.attempts[..3]
        .iter()
        .all(|a| a.target == "primary" && a.failure_class == Some(FailureClass::EmptyOutput)));
    assert_eq!(log.successful_target.as_deref(), Some("fallback-a"));
}

#[tokio::test]
async fn test_narrative_job_writes_named_output() {
    let database = Database::new_in_memory().unwrap();
    database
        .put_document(&SourceDocument::from_text("d2", STORY))
        .unwrap();
    let dispatcher = start(
        &database,
        chain(&[("tagger", Arc::new(ScriptedProvider::new("tagger")))]),
        chain(&[("narrator", narrator())]),
        Arc::new(ChannelProgressSink::default()),
    );

    let outcome = dispatcher
        .enqueue_registered(
            EnqueueRequest::new(TRANSFORM_NARRATIVE_OPERATION)
                .with_metadata(DOCUMENT_ID_KEY, "d2")
                .with_metadata(OUTPUT_ID_KEY, "d2.rewritten"),
        )
        .await
        .unwrap();
    let done = dispatcher.wait_for(outcome.run_id()).await.unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.message.unwrap().starts_with("wrote d2.rewritten"));
    assert!(database.get_document("d2.rewritten").unwrap().is_some());
    assert!(database.get_document("d2.narrative").unwrap().is_none());
}

#[tokio::test]
async fn test_blank_document_fails_without_calling_targets() {
    let database = Database::new_in_memory().unwrap();
    database
        .put_document(&SourceDocument::from_text("blank", "   \n\t"))
        .unwrap();
    let tagger = Arc::new(ScriptedProvider::new("tagger").always("1| [A]"));
    let dispatcher = start(
        &database,
        chain(&[("tagger", tagger.clone())]),
        chain(&[("narrator", narrator())]),
        Arc::new(ChannelProgressSink::default()),
    );

    let outcome = dispatcher
        .enqueue_registered(tag_request("blank"))
        .await
        .unwrap();
    let done = dispatcher.wait_for(outcome.run_id()).await.unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(
        done.message.as_deref(),
        Some("document 'blank' has no text to process")
    );
    assert_eq!(tagger.calls(), 0);
    assert!(database.get_overlay("blank").unwrap().is_none());
}

#[tokio::test]
async fn test_missing_document_id_metadata_fails_job() {
    let database = Database::new_in_memory().unwrap();
    let dispatcher = start(
        &database,
        chain(&[("tagger", Arc::new(ScriptedProvider::new("tagger")))]),
        chain(&[("narrator", narrator())]),
        Arc::new(ChannelProgressSink::default()),
    );

    let outcome = dispatcher
        .enqueue_registered(EnqueueRequest::new(TAG_DOCUMENT_OPERATION))
        .await
        .unwrap();
    let done = dispatcher.wait_for(outcome.run_id()).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.message.unwrap().contains(DOCUMENT_ID_KEY));
}
