//! JSON Configuration Management
//!
//! Handles reading and writing the engine configuration file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::models::settings::{ConfigUpdate, PipelineConfig};
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::{config_path, ensure_dir};

/// Configuration service for managing engine settings
#[derive(Debug)]
pub struct ConfigService {
    config_path: PathBuf,
    config: PipelineConfig,
}

impl ConfigService {
    /// Create a new config service at `~/.story-pipeline/config.json`,
    /// loading existing config or creating defaults
    pub fn new() -> AppResult<Self> {
        Self::open(config_path()?)
    }

    /// Open the config file at `path`, writing defaults if it does not exist
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let config_path = path.into();
        if let Some(parent) = config_path.parent() {
            ensure_dir(parent)?;
        }

        let config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            let default_config = PipelineConfig::default();
            Self::save_to_file(&config_path, &default_config)?;
            info!(path = %config_path.display(), "wrote default pipeline config");
            default_config
        };

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> AppResult<PipelineConfig> {
        let content = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        config.validate().map_err(AppError::validation)?;
        Ok(config)
    }

    /// Save configuration to a file with pretty formatting
    fn save_to_file(path: &Path, config: &PipelineConfig) -> AppResult<()> {
        config.validate().map_err(AppError::validation)?;
        let content = serde_json::to_string_pretty(config)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the current configuration
    pub fn get_config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Update the configuration with a partial update.
    ///
    /// The in-memory copy is left untouched when the result fails validation.
    pub fn update_config(&mut self, update: ConfigUpdate) -> AppResult<PipelineConfig> {
        let mut next = self.config.clone();
        next.apply_update(update);
        Self::save_to_file(&self.config_path, &next)?;
        self.config = next;
        Ok(self.config.clone())
    }

    /// Replace the whole configuration
    pub fn replace_config(&mut self, config: PipelineConfig) -> AppResult<()> {
        Self::save_to_file(&self.config_path, &config)?;
        self.config = config;
        Ok(())
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> AppResult<()> {
        Self::save_to_file(&self.config_path, &self.config)
    }

    /// Reload configuration from disk
    pub fn reload(&mut self) -> AppResult<()> {
        self.config = Self::load_from_file(&self.config_path)?;
        Ok(())
    }

    /// Reset configuration to defaults
    pub fn reset(&mut self) -> AppResult<()> {
        self.config = PipelineConfig::default();
        self.save()
    }
}
