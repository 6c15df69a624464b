//! Narrative Pipeline
//!
//! Overlap-mode job: free text is split into chunks that re-include the tail
//! of the previous chunk, each chunk is rewritten by the generation service
//! under length and marker rules, and the outputs are stitched back together
//! by eliding the duplicated overlap.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use story_pipeline_core::{DocumentStore, SourceDocument};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{fallback_note, run_chunks, ChunkWork, PipelineError, DOCUMENT_ID_KEY, OUTPUT_ID_KEY};
use crate::models::chunk::ChunkBudget;
use crate::models::job::JobOutcome;
use crate::models::settings::PipelineConfig;
use crate::services::chunking::{ChunkPlanner, OverlapMerger};
use crate::services::dispatcher::{JobContext, JobHandler};
use crate::services::execution::{
    ExecutionLog, ExecutorPolicy, FallbackChain, GenerationRequest, LengthRatioValidator,
    MarkerCountValidator,
    NonEmptyValidator, ResilientExecutor, ValidatorSet,
};
use crate::utils::error::AppResult;

const DEFAULT_INSTRUCTIONS: &str = "Rewrite the passage below. Keep every event and line of \
dialogue; do not summarize.";

/// Result of one narrative transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeReport {
    pub output: String,
    pub chunks: usize,
    pub fallback_targets: Vec<String>,
    pub repairs: Vec<String>,
    /// Attempt log of every chunk, in chunk order
    pub logs: Vec<ExecutionLog>,
}

impl NarrativeReport {
    pub fn summary(&self, output_id: &str) -> String {
        format!(
            "wrote {} ({} chunks, {} chars){}",
            output_id,
            self.chunks,
            self.output.chars().count(),
            fallback_note(&self.fallback_targets)
        )
    }
}

/// Narrative Pipeline
pub struct NarrativePipeline {
    documents: Arc<dyn DocumentStore>,
    chain: FallbackChain,
    executor: ResilientExecutor,
    planner: ChunkPlanner,
    merger: OverlapMerger,
    validators: ValidatorSet,
    instructions: String,
    system: Option<String>,
}

impl NarrativePipeline {
    pub fn new(documents: Arc<dyn DocumentStore>, chain: FallbackChain, config: &PipelineConfig) -> Self {
        let validators = ValidatorSet::new()
            .with(NonEmptyValidator)
            .with(LengthRatioValidator::new(config.executor.min_length_ratio));
        Self {
            documents,
            chain,
            executor: ResilientExecutor::new(ExecutorPolicy::from(&config.executor)),
            planner: ChunkPlanner::new(ChunkBudget::from(&config.chunking)),
            merger: OverlapMerger::from(&config.merger),
            validators,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            system: None,
        }
    }

    /// Require at least `min_count` matches of `pattern` in every chunk output
    pub fn with_marker(mut self, label: &str, pattern: &str, min_count: usize) -> AppResult<Self> {
        let validator = MarkerCountValidator::new(label, pattern, min_count)?;
        self.validators = self.validators.with(validator);
        Ok(self)
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_planner(mut self, planner: ChunkPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Rewrite `text` chunk by chunk and merge the outputs.
    pub async fn transform(
        &self,
        text: &str,
        cancel: &CancellationToken,
        job: Option<&JobContext>,
    ) -> Result<NarrativeReport, PipelineError> {
        let chunks = self.planner.plan(text);
        if chunks.is_empty() {
            return Err(PipelineError::EmptyInput("input".to_string()));
        }
        info!(
            chunks = chunks.len(),
            overlap = self.planner.budget().overlap_tokens,
            "transforming narrative"
        );

        let work = chunks
            .iter()
            .map(|chunk| {
                let prompt = format!("{}\n\n{}", self.instructions, chunk.text);
                let mut request = GenerationRequest::new(chunk.index, chunk.text.clone(), prompt);
                if let Some(system) = &self.system {
                    request = request.with_system(system.clone());
                }
                ChunkWork {
                    request,
                    validators: self.validators.clone(),
                }
            })
            .collect();

        let result = run_chunks(&self.executor, &self.chain, work, cancel, job).await?;

        Ok(NarrativeReport {
            output: self.merger.merge(&result.outputs),
            chunks: chunks.len(),
            fallback_targets: result.fallback_targets,
            repairs: result.repairs,
            logs: result.logs,
        })
    }

    /// Transform a stored document and save the result under `output_id`.
    pub async fn transform_document(
        &self,
        document_id: &str,
        output_id: &str,
        cancel: &CancellationToken,
        job: Option<&JobContext>,
    ) -> Result<NarrativeReport, PipelineError> {
        let document = self
            .documents
            .load_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::EmptyInput(document_id.to_string()))?;
        let text = document
            .lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let report = match self.transform(&text, cancel, job).await {
            Err(PipelineError::EmptyInput(_)) => {
                return Err(PipelineError::EmptyInput(document_id.to_string()))
            }
            other => other?,
        };

        self.documents
            .save_document(&SourceDocument::from_text(output_id, &report.output))
            .await?;
        Ok(report)
    }
}

#[async_trait]
impl JobHandler for NarrativePipeline {
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        let Some(document_id) = ctx.meta(DOCUMENT_ID_KEY).map(str::to_string) else {
            return PipelineError::MissingMetadata(DOCUMENT_ID_KEY.to_string()).into_outcome();
        };
        let output_id = ctx
            .meta(OUTPUT_ID_KEY)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.narrative", document_id));

        match self
            .transform_document(&document_id, &output_id, ctx.cancellation_token(), Some(&ctx))
            .await
        {
            Ok(report) => JobOutcome::completed_with(report.summary(&output_id)),
            Err(e) => e.into_outcome(),
        }
    }
}
