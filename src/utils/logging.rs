//! Tracing Initialization
//!
//! Installs a `tracing-subscriber` fmt subscriber for binaries and tests
//! that embed the engine.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive.
pub const LOG_ENV_VAR: &str = "STORY_PIPELINE_LOG";

/// Initialize tracing for the process.
///
/// The filter comes from `STORY_PIPELINE_LOG`, then `default_directive`,
/// then `info`. Safe to call multiple times (subsequent calls are no-ops).
pub fn init_tracing(default_directive: Option<&str>) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(default_directive.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
