//! Services
//!
//! The engine's business logic: chunk planning and merging, resilient
//! chunk execution, the task dispatcher, the step orchestrator, the
//! pipelines built on them, and progress sinks.

pub mod chunking;
pub mod dispatcher;
pub mod execution;
pub mod pipeline;
pub mod progress;
pub mod steps;

pub use chunking::{ChunkPlanner, OverlapMerger};
pub use dispatcher::{DispatchError, EnqueueOutcome, EnqueueRequest, JobContext, TaskDispatcher};
pub use execution::{FallbackChain, ResilientExecutor, ValidatorSet};
pub use pipeline::{NarrativePipeline, PipelineError, TaggingPipeline};
pub use progress::{ChannelProgressSink, FanoutProgressSink, ProgressEvent, TracingProgressSink};
pub use steps::StepOrchestrator;
