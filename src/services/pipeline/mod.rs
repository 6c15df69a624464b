//! Pipelines
//!
//! End-to-end jobs built from the chunk planner, the resilient executor and
//! the mergers:
//! - `TaggingPipeline` annotates a line-addressed document (deterministic
//!   chunks, overlay merge) and chains a follow-on operation
//! - `NarrativePipeline` rewrites free text (overlapping chunks, overlap
//!   merge)

pub mod narrative;
pub mod tagging;

pub use narrative::{NarrativePipeline, NarrativeReport};
pub use tagging::{TaggingPipeline, TaggingReport};

use story_pipeline_core::{CoreError, ProgressLevel};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::job::JobOutcome;
use crate::services::dispatcher::JobContext;
use crate::services::execution::{
    ChunkExecutionOutcome, ExecutionLog, FallbackChain, GenerationRequest, ResilientExecutor,
    ValidatorSet,
};
use crate::utils::error::AppError;

/// Metadata key naming the document a pipeline job works on
pub const DOCUMENT_ID_KEY: &str = "documentId";

/// Metadata key naming the document a pipeline job writes
pub const OUTPUT_ID_KEY: &str = "outputId";

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("document '{0}' has no text to process")]
    EmptyInput(String),

    #[error("missing job metadata '{0}'")]
    MissingMetadata(String),

    #[error("chunk {chunk} failed: {reason}")]
    ChunkFailed { chunk: usize, reason: String },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error(transparent)]
    App(#[from] AppError),
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        PipelineError::App(AppError::from(err))
    }
}

impl PipelineError {
    /// Cancellation stays a distinct outcome; everything else fails the job.
    pub fn into_outcome(self) -> JobOutcome {
        match self {
            PipelineError::Cancelled => JobOutcome::Cancelled,
            other => JobOutcome::failed(other.to_string()),
        }
    }
}

/// One chunk's request and the rules its output must pass
pub(crate) struct ChunkWork {
    pub request: GenerationRequest,
    pub validators: ValidatorSet,
}

/// Accepted outputs of a chunk loop, in chunk order
#[derive(Debug, Default)]
pub(crate) struct ChunkLoopResult {
    pub outputs: Vec<String>,
    /// Fallback targets that produced at least one accepted output
    pub fallback_targets: Vec<String>,
    pub repairs: Vec<String>,
    pub logs: Vec<ExecutionLog>,
}

/// Run chunks in order, stopping at the first failure or cancellation.
pub(crate) async fn run_chunks(
    executor: &ResilientExecutor,
    chain: &FallbackChain,
    work: Vec<ChunkWork>,
    cancel: &CancellationToken,
    job: Option<&JobContext>,
) -> Result<ChunkLoopResult, PipelineError> {
    let total = work.len() as u32;
    let mut result = ChunkLoopResult::default();

    for (index, chunk) in work.into_iter().enumerate() {
        if cancel.is_cancelled() {
            info!(chunk = index, "chunk loop cancelled");
            return Err(PipelineError::Cancelled);
        }

        if let Some(ctx) = job {
            ctx.set_step(
                index as u32,
                total,
                Some(&format!("chunk {}/{}", index + 1, total)),
            );
        }

        let execution = executor
            .run(&chunk.request, chain, &chunk.validators, cancel)
            .await;
        result.logs.push(execution.log);

        match execution.outcome {
            ChunkExecutionOutcome::Succeeded {
                output,
                attempt,
                repairs,
            } => {
                debug!(chunk = index, target = %attempt.target, "chunk accepted");
                if attempt.used_fallback && !result.fallback_targets.contains(&attempt.target) {
                    if let Some(ctx) = job {
                        ctx.log(
                            &format!("chunk {} used fallback {}", index + 1, attempt.target),
                            ProgressLevel::Warning,
                        );
                    }
                    result.fallback_targets.push(attempt.target);
                }
                result.repairs.extend(repairs);
                result.outputs.push(output);
            }
            ChunkExecutionOutcome::Failed { reason, .. } => {
                warn!(chunk = index, error = %reason, "chunk failed");
                return Err(PipelineError::ChunkFailed {
                    chunk: index,
                    reason,
                });
            }
            ChunkExecutionOutcome::Cancelled => return Err(PipelineError::Cancelled),
        }
    }

    if let Some(ctx) = job {
        ctx.set_step(total, total, Some("chunks complete"));
    }
    Ok(result)
}

/// `"; fallback used: a, b"` or nothing
pub(crate) fn fallback_note(targets: &[String]) -> String {
    if targets.is_empty() {
        String::new()
    } else {
        format!("; fallback used: {}", targets.join(", "))
    }
}
