//! Engine State
//!
//! Wires the configuration, the SQLite stores and the dispatcher together and
//! registers the built-in pipeline operations.

use std::sync::Arc;

use story_pipeline_core::ProgressSink;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::settings::{ConfigUpdate, PipelineConfig};
use crate::services::dispatcher::{OperationRegistry, TaskDispatcher};
use crate::services::execution::FallbackChain;
use crate::services::pipeline::{NarrativePipeline, TaggingPipeline};
use crate::services::steps::{StepChecker, StepExecutor, StepOrchestrator};
use crate::storage::{ConfigService, Database};
use crate::utils::error::AppResult;

/// Operation name of the tagging pipeline
pub const TAG_DOCUMENT_OPERATION: &str = "tag_document";

/// Operation name of the narrative pipeline
pub const TRANSFORM_NARRATIVE_OPERATION: &str = "transform_narrative";

/// Generation target role used by the tagging pipeline
pub const TAGGING_ROLE: &str = "tagging";

/// Generation target role used by the narrative pipeline
pub const NARRATIVE_ROLE: &str = "narrative";

/// Running engine: config, stores and dispatcher
pub struct EngineState {
    config: Arc<RwLock<ConfigService>>,
    database: Database,
    dispatcher: TaskDispatcher,
    progress: Arc<dyn ProgressSink>,
}

impl EngineState {
    /// Start with the default config file and database under `~/.story-pipeline`.
    pub fn open_default(progress: Arc<dyn ProgressSink>) -> AppResult<Self> {
        Self::start(ConfigService::new()?, Database::new()?, progress)
    }

    /// Start the dispatcher with pipelines registered for every role that
    /// has at least one generation target.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(
        config: ConfigService,
        database: Database,
        progress: Arc<dyn ProgressSink>,
    ) -> AppResult<Self> {
        let registry = build_registry(config.get_config(), &database)?;
        info!(operations = ?registry.names(), "starting engine");

        let dispatcher = TaskDispatcher::spawn_with_registry(
            config.get_config().dispatcher.clone(),
            progress.clone(),
            registry,
        );

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            database,
            dispatcher,
            progress,
        })
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn progress(&self) -> &Arc<dyn ProgressSink> {
        &self.progress
    }

    /// Check if database is healthy
    pub fn is_database_healthy(&self) -> bool {
        self.database.is_healthy()
    }

    /// Get the current configuration
    pub async fn get_config(&self) -> PipelineConfig {
        self.config.read().await.get_config().clone()
    }

    /// Update and persist the configuration.
    ///
    /// Dispatcher limits take effect on the next start.
    pub async fn update_config(&self, update: ConfigUpdate) -> AppResult<PipelineConfig> {
        self.config.write().await.update_config(update)
    }

    /// Step orchestrator backed by the engine database.
    pub async fn step_orchestrator(
        &self,
        executor: Arc<dyn StepExecutor>,
        checker: Arc<dyn StepChecker>,
    ) -> Arc<StepOrchestrator> {
        let settings = self.get_config().await.steps;
        Arc::new(
            StepOrchestrator::new(
                Arc::new(self.database.clone()),
                executor,
                checker,
                self.progress.clone(),
            )
            .with_settings(settings),
        )
    }

    /// Ids of step executions that can still be resumed.
    pub fn resumable_step_executions(&self) -> AppResult<Vec<String>> {
        self.database.list_resumable_step_executions()
    }

    /// Stop the dispatcher, cancelling running jobs.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}

fn build_registry(config: &PipelineConfig, database: &Database) -> AppResult<OperationRegistry> {
    let mut registry = OperationRegistry::new();
    let store = Arc::new(database.clone());

    let narrative_targets = config.targets_for(NARRATIVE_ROLE);
    let has_narrative = !narrative_targets.is_empty();
    if has_narrative {
        let chain = FallbackChain::from_configs(narrative_targets)?;
        registry.register(
            TRANSFORM_NARRATIVE_OPERATION,
            Arc::new(NarrativePipeline::new(store.clone(), chain, config)),
        );
    } else {
        warn!(role = NARRATIVE_ROLE, "no generation targets; operation not registered");
    }

    let tagging_targets = config.targets_for(TAGGING_ROLE);
    if !tagging_targets.is_empty() {
        let chain = FallbackChain::from_configs(tagging_targets)?;
        let mut pipeline = TaggingPipeline::new(store.clone(), store, chain, config);
        if has_narrative {
            pipeline = pipeline.with_follow_on(TRANSFORM_NARRATIVE_OPERATION);
        }
        registry.register(TAG_DOCUMENT_OPERATION, Arc::new(pipeline));
    } else {
        warn!(role = TAGGING_ROLE, "no generation targets; operation not registered");
    }

    Ok(registry)
}
