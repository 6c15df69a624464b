//! Line Overlay Codec
//!
//! Renders a line-addressed chunk as numbered lines (`12| text`) for the
//! generation service, and reads back per-line annotations from its reply.
//! The annotation itself is opaque; only the `id| annotation` framing is
//! parsed.

use std::collections::HashMap;

use story_pipeline_core::{AnnotationOverlay, SourceDocument, SourceLine};

use crate::models::chunk::Chunk;

/// Separator between the line id and its content
pub const LINE_ID_SEPARATOR: char = '|';

/// Render lines as `id| text`, one per line.
pub fn render_numbered<'a, I>(lines: I) -> String
where
    I: IntoIterator<Item = &'a SourceLine>,
{
    lines
        .into_iter()
        .map(|line| format!("{}{} {}", line.id, LINE_ID_SEPARATOR, line.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lines of `document` covered by `chunk`, in document order.
pub fn chunk_lines<'a>(document: &'a SourceDocument, chunk: &Chunk) -> Vec<&'a SourceLine> {
    let by_id: HashMap<u64, &SourceLine> = document.lines.iter().map(|l| (l.id, l)).collect();
    chunk
        .row_ids
        .iter()
        .filter_map(|id| by_id.get(id).copied())
        .collect()
}

/// Parse `id| annotation` (or `id: annotation`) lines from a reply.
///
/// Lines that do not start with a numeric id, or whose annotation is empty,
/// are ignored. A repeated id keeps its last annotation.
pub fn parse_annotations(output: &str) -> AnnotationOverlay {
    let mut overlay = AnnotationOverlay::new();
    for raw in output.lines() {
        if let Some((id, annotation)) = parse_line(raw) {
            overlay.insert(id, annotation.to_string());
        }
    }
    overlay
}

fn parse_line(raw: &str) -> Option<(u64, &str)> {
    let line = raw.trim();
    let digits_end = line
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(idx, _)| idx)?;
    if digits_end == 0 {
        return None;
    }
    let id: u64 = line[..digits_end].parse().ok()?;
    let rest = line[digits_end..].trim_start();
    let rest = rest
        .strip_prefix(LINE_ID_SEPARATOR)
        .or_else(|| rest.strip_prefix(':'))?;
    let annotation = rest.trim();
    if annotation.is_empty() {
        None
    } else {
        Some((id, annotation))
    }
}
