//! Chunk Merger
//!
//! Reassembles per-chunk outputs into one document.
//!
//! - Overlap mode: each output may repeat the tail of the previous one; the
//!   longest bounded suffix/prefix match is elided.
//! - Deterministic mode: the document is rebuilt from the original source
//!   lines plus a sparse per-line annotation overlay. Source text is never
//!   rewritten.

use story_pipeline_core::{AnnotationOverlay, SourceDocument};
use tracing::debug;

use crate::models::settings::MergerSettings;

/// Separator used when two outputs share no overlap
pub const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Merges overlapping narrative outputs
#[derive(Debug, Clone)]
pub struct OverlapMerger {
    max_search_chars: usize,
    min_overlap_chars: usize,
}

impl Default for OverlapMerger {
    fn default() -> Self {
        Self::from(&MergerSettings::default())
    }
}

impl From<&MergerSettings> for OverlapMerger {
    fn from(settings: &MergerSettings) -> Self {
        Self::new(settings.max_search_chars, settings.min_overlap_chars)
    }
}

impl OverlapMerger {
    /// Build a merger searching at most `max_search_chars` characters.
    ///
    /// A suffix/prefix match shorter than `min_overlap_chars` is not elided:
    /// the outputs are joined with [`PARAGRAPH_SEPARATOR`] and the repeated
    /// text stays in the result. The default of 24 keeps a shared word or
    /// closing punctuation from being taken for context overlap, so callers
    /// whose chunks overlap by less than that should pass a smaller value.
    /// Values below 1 are raised to 1.
    pub fn new(max_search_chars: usize, min_overlap_chars: usize) -> Self {
        Self {
            max_search_chars,
            min_overlap_chars: min_overlap_chars.max(1),
        }
    }

    /// Merge ordered outputs into one document.
    ///
    /// Empty outputs are skipped. A single output is returned unchanged.
    pub fn merge<S: AsRef<str>>(&self, outputs: &[S]) -> String {
        let mut merged = String::new();
        for output in outputs.iter().map(AsRef::as_ref) {
            if output.trim().is_empty() {
                continue;
            }
            if merged.is_empty() {
                merged.push_str(output);
                continue;
            }
            self.append(&mut merged, output);
        }
        merged
    }

    fn append(&self, merged: &mut String, next: &str) {
        let trimmed_len = merged.trim_end().len();
        merged.truncate(trimmed_len);
        let next = next.trim_start();

        let overlap = self.overlap_len(merged, next);
        if overlap > 0 {
            debug!(overlap_bytes = overlap, "elided duplicated chunk boundary");
            merged.push_str(&next[overlap..]);
        } else {
            merged.push_str(PARAGRAPH_SEPARATOR);
            merged.push_str(next);
        }
    }

    /// Byte length of the longest suffix of `prev` that equals a prefix of
    /// `next`, searching at most `max_search_chars` characters. Returns 0
    /// when the best match is shorter than `min_overlap_chars`.
    pub fn overlap_len(&self, prev: &str, next: &str) -> usize {
        // Candidate prefix lengths of `next`, in bytes, on char boundaries.
        let boundaries: Vec<usize> = next
            .char_indices()
            .map(|(idx, ch)| idx + ch.len_utf8())
            .take(self.max_search_chars)
            .collect();

        for (chars, &len) in boundaries.iter().enumerate().rev() {
            if chars + 1 < self.min_overlap_chars {
                break;
            }
            if len <= prev.len() && prev.ends_with(&next[..len]) {
                return len;
            }
        }
        0
    }
}

/// Rebuild a line-addressed document with annotations prefixed to the
/// lines they belong to. Lines without an annotation are emitted as-is.
pub fn merge_overlay(document: &SourceDocument, overlay: &AnnotationOverlay) -> String {
    document
        .lines
        .iter()
        .map(|line| match overlay.get(&line.id) {
            Some(annotation) if line.text.is_empty() => annotation.clone(),
            Some(annotation) => format!("{} {}", annotation, line.text),
            None => line.text.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Combine per-chunk overlays. Later chunks win on conflicting line ids.
pub fn combine_overlays<I>(overlays: I) -> AnnotationOverlay
where
    I: IntoIterator<Item = AnnotationOverlay>,
{
    let mut combined = AnnotationOverlay::new();
    for overlay in overlays {
        combined.extend(overlay);
    }
    combined
}
