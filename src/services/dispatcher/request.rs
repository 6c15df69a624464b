//! Enqueue Requests
//!
//! Builder for everything a job carries besides its work: run id, scope,
//! priority, metadata and the metadata keys that make up its dedup key.

use serde::{Deserialize, Serialize};

use crate::models::job::JobMetadata;

/// Parameters of one enqueue call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    /// Operation name (registry key for registered operations)
    pub operation: String,
    /// Caller-chosen run id; a UUID is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Jobs sharing a scope run one at a time; defaults to the run id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Lower value is dispatched first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: JobMetadata,
    /// Metadata keys identifying the logical operation for dedup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dedup_keys: Vec<String>,
    /// Initial step total, if known up front
    #[serde(default)]
    pub max_step: u32,
}

impl EnqueueRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            run_id: None,
            scope: None,
            priority: 0,
            metadata: JobMetadata::new(),
            dedup_keys: Vec::new(),
            max_step: 0,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Suppress this job while another job of the same operation with the
    /// same values for `keys` is queued or running.
    pub fn dedup_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dedup_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_step(mut self, max_step: u32) -> Self {
        self.max_step = max_step;
        self
    }

    /// Logical key used for dedup, or `None` when dedup is off.
    ///
    /// The key is the JSON encoding of the operation and the sorted
    /// `(key, value)` pairs, so values containing separators cannot collide.
    /// Missing metadata values count as empty strings.
    pub fn dedup_key(&self) -> Option<String> {
        if self.dedup_keys.is_empty() {
            return None;
        }
        let mut keys: Vec<&str> = self.dedup_keys.iter().map(String::as_str).collect();
        keys.sort_unstable();
        keys.dedup();
        let pairs: Vec<(&str, &str)> = keys
            .into_iter()
            .map(|k| (k, self.metadata.get(k).map(String::as_str).unwrap_or("")))
            .collect();
        serde_json::to_string(&(&self.operation, pairs)).ok()
    }
}
