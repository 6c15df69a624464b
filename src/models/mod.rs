//! Data Models
//!
//! Contains the data structures shared by the engine's services.

pub mod attempt;
pub mod chunk;
pub mod job;
pub mod settings;

pub use attempt::*;
pub use chunk::*;
pub use job::*;
pub use settings::*;
