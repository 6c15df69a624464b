//! Cross-Platform Path Utilities
//!
//! Functions for resolving the engine's data directory (~/.story-pipeline/).

use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Get the user's home directory
pub fn home_dir() -> AppResult<PathBuf> {
    dirs::home_dir().ok_or_else(|| AppError::config("Could not determine home directory"))
}

/// Get the data directory (~/.story-pipeline/)
pub fn story_pipeline_dir() -> AppResult<PathBuf> {
    Ok(home_dir()?.join(".story-pipeline"))
}

/// Get the config file path (~/.story-pipeline/config.json)
pub fn config_path() -> AppResult<PathBuf> {
    Ok(story_pipeline_dir()?.join("config.json"))
}

/// Get the database file path (~/.story-pipeline/pipeline.db)
pub fn database_path() -> AppResult<PathBuf> {
    Ok(story_pipeline_dir()?.join("pipeline.db"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> AppResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Get the data directory, creating if it doesn't exist
pub fn ensure_story_pipeline_dir() -> AppResult<PathBuf> {
    let path = story_pipeline_dir()?;
    ensure_dir(&path)?;
    Ok(path)
}
