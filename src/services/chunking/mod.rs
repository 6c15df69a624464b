//! Chunking
//!
//! Token-budgeted chunk planning, the numbered-line overlay codec and the
//! output mergers for both chunk modes.

pub mod merger;
pub mod overlay;
pub mod planner;

pub use merger::{combine_overlays, merge_overlay, OverlapMerger, PARAGRAPH_SEPARATOR};
pub use overlay::{chunk_lines, parse_annotations, render_numbered};
pub use planner::{segment_text, ChunkPlanner};
