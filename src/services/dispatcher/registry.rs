//! Operation Registry
//!
//! Maps operation names to typed handlers so callers (and chained jobs) can
//! enqueue work by name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::context::JobContext;
use crate::models::job::JobOutcome;

/// Handler for a named operation
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> JobOutcome;
}

/// Adapter turning an async closure into a handler
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        (self.0)(ctx).await
    }
}

/// Registry of named operations
#[derive(Default, Clone)]
pub struct OperationRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    order: Vec<String>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.order)
            .finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler with the same name
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_none() {
            self.order.push(name);
        }
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)));
    }

    /// Remove a handler; returns true when it existed
    pub fn unregister(&mut self, name: &str) -> bool {
        if self.handlers.remove(name).is_some() {
            self.order.retain(|n| n != name);
            true
        } else {
            false
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Operation names in registration order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
