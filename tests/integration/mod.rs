//! Integration Tests Module
//!
//! End-to-end tests for the story pipeline engine: chunk planning and
//! merging, resilient execution, the task dispatcher, the step orchestrator
//! and the pipelines that combine them.

// Scripted providers and helpers
mod support;

// Chunk planner and merger properties
mod chunking_test;

// Retry and fallback escalation
mod executor_test;

// Priority, scope, dedup and cancellation in the dispatcher
mod dispatcher_test;

// Resumable step executions
mod steps_test;

// Tagging and narrative pipelines through the dispatcher
mod pipeline_test;
