//! In-Memory Stores
//!
//! Process-local implementations of the persistence traits, used by tests
//! and by embedders that keep records elsewhere.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use story_pipeline_core::{
    AnnotationOverlay, CoreResult, DocumentStore, OverlayStore, SourceDocument, StepExecution,
    StepExecutionStore,
};
use tokio::sync::RwLock;

/// All three stores behind shared maps. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    executions: Arc<RwLock<HashMap<String, StepExecution>>>,
    overlays: Arc<RwLock<HashMap<String, AnnotationOverlay>>>,
    documents: Arc<RwLock<HashMap<String, SourceDocument>>>,
    /// Every saved execution, in save order
    history: Arc<RwLock<Vec<StepExecution>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_document(&self, document: SourceDocument) {
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document);
    }

    /// Every execution record saved so far, oldest first.
    pub async fn save_history(&self) -> Vec<StepExecution> {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl StepExecutionStore for MemoryStore {
    async fn load(&self, id: &str) -> CoreResult<Option<StepExecution>> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn save(&self, execution: &StepExecution) -> CoreResult<()> {
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        self.history.write().await.push(execution.clone());
        Ok(())
    }
}

#[async_trait]
impl OverlayStore for MemoryStore {
    async fn save_overlay(&self, document_id: &str, overlay: &AnnotationOverlay) -> CoreResult<()> {
        self.overlays
            .write()
            .await
            .insert(document_id.to_string(), overlay.clone());
        Ok(())
    }

    async fn load_overlay(&self, document_id: &str) -> CoreResult<Option<AnnotationOverlay>> {
        Ok(self.overlays.read().await.get(document_id).cloned())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_document(&self, id: &str) -> CoreResult<Option<SourceDocument>> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn save_document(&self, document: &SourceDocument) -> CoreResult<()> {
        self.insert_document(document.clone()).await;
        Ok(())
    }
}
