//! Story Pipeline Core
//!
//! Foundational error types and collaborator interfaces for the story
//! pipeline workspace. This crate has no dependencies on the engine itself
//! (dispatcher, generation providers, SQLite, etc.).
//!
//! ## Module Organization
//!
//! - `error` - Core error types (`CoreError`, `CoreResult`)
//! - `progress` - Progress-broadcast collaborator (`ProgressSink`, `ProgressLevel`)
//! - `persistence` - Storage records and traits (`StepExecution`, `StepExecutionStore`, `OverlayStore`, `DocumentStore`)
//!
//! ## Design Principles
//!
//! 1. **Minimal dependencies** - serde, async-trait, thiserror and chrono only
//! 2. **Trait-based collaborators** - storage and progress reporting are injected
//! 3. **Unidirectional dependency** - this crate depends on nothing else in the workspace

pub mod error;
pub mod persistence;
pub mod progress;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── Progress ───────────────────────────────────────────────────────────
pub use progress::{NoopProgressSink, ProgressLevel, ProgressSink};

// ── Persistence ────────────────────────────────────────────────────────
pub use persistence::{
    AnnotationOverlay, DocumentStore, OverlayStore, SourceDocument, SourceLine, StepExecution,
    StepExecutionStore, StepStatus,
};
