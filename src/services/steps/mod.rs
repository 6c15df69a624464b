//! Step Execution
//!
//! Resumable executor/checker state machine for tasks expressed as a
//! bounded sequence of steps.

pub mod orchestrator;

pub use orchestrator::{CheckVerdict, StepChecker, StepContext, StepExecutor, StepOrchestrator};
