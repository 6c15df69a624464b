//! Progress Sinks
//!
//! Concrete [`ProgressSink`] implementations:
//! - `TracingProgressSink` writes progress as structured tracing events
//! - `ChannelProgressSink` fans progress out to live subscribers over a
//!   broadcast channel
//! - `FanoutProgressSink` forwards every call to several sinks

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use story_pipeline_core::{ProgressLevel, ProgressSink};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Progress event published to live subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Log {
        run_id: String,
        message: String,
        level: ProgressLevel,
        at: DateTime<Utc>,
    },
    Step {
        id: String,
        current: u32,
        max: u32,
        description: Option<String>,
    },
    Completed {
        id: String,
        status: String,
    },
}

impl ProgressEvent {
    /// Run or execution id the event belongs to
    pub fn id(&self) -> &str {
        match self {
            ProgressEvent::Log { run_id, .. } => run_id,
            ProgressEvent::Step { id, .. } => id,
            ProgressEvent::Completed { id, .. } => id,
        }
    }
}

// ============================================================================
// Tracing
// ============================================================================

/// Writes progress to the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn append(&self, run_id: &str, message: &str, level: ProgressLevel) {
        match level {
            ProgressLevel::Debug => debug!(run_id = %run_id, "{}", message),
            ProgressLevel::Info => info!(run_id = %run_id, "{}", message),
            ProgressLevel::Warning => warn!(run_id = %run_id, "{}", message),
            ProgressLevel::Error => error!(run_id = %run_id, "{}", message),
        }
    }

    fn broadcast_step_progress(&self, id: &str, current: u32, max: u32, description: Option<&str>) {
        debug!(id = %id, current, max, description = ?description, "step progress");
    }

    fn broadcast_completion(&self, id: &str, status: &str) {
        info!(id = %id, status = %status, "completed");
    }
}

// ============================================================================
// Broadcast channel
// ============================================================================

/// Publishes progress on a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ChannelProgressSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ChannelProgressSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: ProgressEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

impl ProgressSink for ChannelProgressSink {
    fn append(&self, run_id: &str, message: &str, level: ProgressLevel) {
        self.publish(ProgressEvent::Log {
            run_id: run_id.to_string(),
            message: message.to_string(),
            level,
            at: Utc::now(),
        });
    }

    fn broadcast_step_progress(&self, id: &str, current: u32, max: u32, description: Option<&str>) {
        self.publish(ProgressEvent::Step {
            id: id.to_string(),
            current,
            max,
            description: description.map(str::to_string),
        });
    }

    fn broadcast_completion(&self, id: &str, status: &str) {
        self.publish(ProgressEvent::Completed {
            id: id.to_string(),
            status: status.to_string(),
        });
    }
}

// ============================================================================
// Fan-out
// ============================================================================

/// Forwards to every inner sink in order
#[derive(Clone, Default)]
pub struct FanoutProgressSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ProgressSink for FanoutProgressSink {
    fn append(&self, run_id: &str, message: &str, level: ProgressLevel) {
        for sink in &self.sinks {
            sink.append(run_id, message, level);
        }
    }

    fn broadcast_step_progress(&self, id: &str, current: u32, max: u32, description: Option<&str>) {
        for sink in &self.sinks {
            sink.broadcast_step_progress(id, current, max, description);
        }
    }

    fn broadcast_completion(&self, id: &str, status: &str) {
        for sink in &self.sinks {
            sink.broadcast_completion(id, status);
        }
    }
}
