//! Resilient Execution
//!
//! Validation-driven retry and fallback escalation for single chunks.

pub mod executor;
pub mod fallback;
pub mod validators;

pub use executor::{
    ChunkExecution, ChunkExecutionOutcome, ExecutorPolicy, GenerationRequest, ResilientExecutor,
};
pub use fallback::{
    AttemptRecord, ExecutionLog, FailureClass, FallbackChain, GenerationTarget,
};
pub use validators::{
    LengthRatioValidator, MarkerCountValidator, NonEmptyValidator, OutputValidator,
    RequiredAnnotationValidator, ValidationReport, ValidatorSet, Verdict,
};
