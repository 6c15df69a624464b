//! Storage Layer
//!
//! Handles all data persistence: SQLite database, in-memory stores and JSON config.

pub mod config;
pub mod database;
pub mod memory;

pub use config::*;
pub use database::*;
pub use memory::*;
