//! Story Pipeline - Engine Library
//!
//! Asynchronous task dispatch and resilient chunk processing for long-running
//! text-generation jobs. It includes:
//! - A priority- and scope-aware task dispatcher with dedup and chaining
//! - Token-budgeted chunk planning and output merging
//! - Validation-driven retry and fallback execution against generation targets
//! - A resumable executor/checker step orchestrator
//! - Storage adapters (SQLite, in-memory, JSON config) and utilities

pub mod models;
pub mod services;
pub mod state;
pub mod storage;
pub mod utils;

pub use models::settings::{ConfigUpdate, PipelineConfig};
pub use services::dispatcher::{
    DispatchError, EnqueueOutcome, EnqueueRequest, JobContext, OperationRegistry, TaskDispatcher,
};
pub use services::steps::{StepChecker, StepExecutor, StepOrchestrator};
pub use state::EngineState;
pub use utils::error::{AppError, AppResult};
