//! Tagging Pipeline
//!
//! Deterministic-mode job: a line-addressed document is split into disjoint
//! line chunks, each chunk is sent as numbered lines, and the reply is read
//! back as a sparse per-line overlay. Every non-blank line must be
//! annotated. The source text itself is never rewritten.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use story_pipeline_core::{AnnotationOverlay, DocumentStore, OverlayStore, ProgressLevel};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{fallback_note, run_chunks, ChunkWork, PipelineError, DOCUMENT_ID_KEY};
use crate::models::chunk::ChunkBudget;
use crate::models::job::JobOutcome;
use crate::models::settings::PipelineConfig;
use crate::services::chunking::{
    chunk_lines, combine_overlays, merge_overlay, parse_annotations, render_numbered, ChunkPlanner,
};
use crate::services::dispatcher::{EnqueueRequest, JobContext, JobHandler};
use crate::services::execution::{
    ExecutionLog, ExecutorPolicy, FallbackChain, GenerationRequest, NonEmptyValidator,
    RequiredAnnotationValidator, ResilientExecutor, ValidatorSet,
};

const DEFAULT_INSTRUCTIONS: &str = "Annotate every numbered line below. Reply with one \
line per input line in the form `id| annotation`, keeping the ids unchanged.";

/// Result of tagging one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggingReport {
    pub document_id: String,
    pub chunks: usize,
    pub overlay: AnnotationOverlay,
    /// Document text with annotations applied
    pub merged: String,
    pub fallback_targets: Vec<String>,
    pub repairs: Vec<String>,
    /// Attempt log of every chunk, in chunk order
    pub logs: Vec<ExecutionLog>,
}

impl TaggingReport {
    /// One-line summary used as the job message
    pub fn summary(&self) -> String {
        format!(
            "tagged {} ({} chunks, {} lines annotated){}",
            self.document_id,
            self.chunks,
            self.overlay.len(),
            fallback_note(&self.fallback_targets)
        )
    }
}

/// Tagging Pipeline
pub struct TaggingPipeline {
    documents: Arc<dyn DocumentStore>,
    overlays: Arc<dyn OverlayStore>,
    chain: FallbackChain,
    executor: ResilientExecutor,
    planner: ChunkPlanner,
    placeholder: String,
    instructions: String,
    system: Option<String>,
    follow_on: Option<String>,
}

impl TaggingPipeline {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        overlays: Arc<dyn OverlayStore>,
        chain: FallbackChain,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            documents,
            overlays,
            chain,
            executor: ResilientExecutor::new(ExecutorPolicy::from(&config.executor)),
            planner: ChunkPlanner::new(ChunkBudget::from(&config.chunking).disjoint()),
            placeholder: config.executor.placeholder_annotation.clone(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            system: None,
            follow_on: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Operation enqueued for the same document after a successful run
    pub fn with_follow_on(mut self, operation: impl Into<String>) -> Self {
        self.follow_on = Some(operation.into());
        self
    }

    pub fn with_planner(mut self, planner: ChunkPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Annotate a document and persist its overlay.
    pub async fn tag_document(
        &self,
        document_id: &str,
        cancel: &CancellationToken,
        job: Option<&JobContext>,
    ) -> Result<TaggingReport, PipelineError> {
        let document = self
            .documents
            .load_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::EmptyInput(document_id.to_string()))?;

        let chunks = self.planner.plan_document(&document);
        if chunks.is_empty() {
            return Err(PipelineError::EmptyInput(document_id.to_string()));
        }
        info!(
            document_id = %document_id,
            lines = document.lines.len(),
            chunks = chunks.len(),
            "tagging document"
        );

        let mut work = Vec::with_capacity(chunks.len());
        let mut chunk_ids = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let lines = chunk_lines(&document, chunk);
            let required: Vec<u64> = lines
                .iter()
                .filter(|l| !l.text.trim().is_empty())
                .map(|l| l.id)
                .collect();
            let numbered = render_numbered(lines.iter().copied());
            let prompt = format!("{}\n\n{}", self.instructions, numbered);

            let mut request = GenerationRequest::new(chunk.index, numbered, prompt);
            if let Some(system) = &self.system {
                request = request.with_system(system.clone());
            }
            let validators = ValidatorSet::new()
                .with(NonEmptyValidator)
                .with(RequiredAnnotationValidator::new(
                    required,
                    self.placeholder.clone(),
                ));

            chunk_ids.push(chunk.row_ids.clone());
            work.push(ChunkWork {
                request,
                validators,
            });
        }

        let result = run_chunks(&self.executor, &self.chain, work, cancel, job).await?;

        // Annotations for ids outside their chunk are dropped.
        let per_chunk = result
            .outputs
            .iter()
            .zip(&chunk_ids)
            .map(|(output, ids)| {
                let mut overlay = parse_annotations(output);
                overlay.retain(|id, _| ids.contains(id));
                overlay
            });
        let overlay = combine_overlays(per_chunk);

        self.overlays.save_overlay(document_id, &overlay).await?;

        Ok(TaggingReport {
            document_id: document_id.to_string(),
            chunks: chunks.len(),
            merged: merge_overlay(&document, &overlay),
            overlay,
            fallback_targets: result.fallback_targets,
            repairs: result.repairs,
            logs: result.logs,
        })
    }

    /// Enqueue the follow-on operation; failures are logged, never returned.
    async fn chain_follow_on(&self, ctx: &JobContext, document_id: &str) {
        let Some(operation) = &self.follow_on else {
            return;
        };
        let request = EnqueueRequest::new(operation.clone())
            .with_scope(ctx.scope())
            .with_metadata(DOCUMENT_ID_KEY, document_id)
            .dedup_on([DOCUMENT_ID_KEY]);

        match ctx.dispatcher().enqueue_registered(request).await {
            Ok(outcome) => {
                info!(
                    run_id = %ctx.run_id(),
                    follow_on = %operation,
                    follow_on_run_id = %outcome.run_id(),
                    suppressed = outcome.is_suppressed(),
                    "follow-on enqueued"
                );
                ctx.log(
                    &format!("Queued {} as {}", operation, outcome.run_id()),
                    ProgressLevel::Info,
                );
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id(), follow_on = %operation, error = %e, "follow-on not enqueued");
                ctx.log(
                    &format!("Could not queue {}: {}", operation, e),
                    ProgressLevel::Warning,
                );
            }
        }
    }
}

#[async_trait]
impl JobHandler for TaggingPipeline {
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        let Some(document_id) = ctx.meta(DOCUMENT_ID_KEY).map(str::to_string) else {
            return PipelineError::MissingMetadata(DOCUMENT_ID_KEY.to_string()).into_outcome();
        };

        match self
            .tag_document(&document_id, ctx.cancellation_token(), Some(&ctx))
            .await
        {
            Ok(report) => {
                self.chain_follow_on(&ctx, &document_id).await;
                JobOutcome::completed_with(report.summary())
            }
            Err(e) => e.into_outcome(),
        }
    }
}
