//! Chunk Planner
//!
//! Splits long text into boundary-respecting, token-budgeted chunks.
//!
//! Text is first decomposed into atomic segments at hard boundaries (line
//! breaks and sentence punctuation). Segments are then accumulated greedily:
//! once a chunk holds `min_tokens` it closes on reaching `target_tokens` or
//! when the next segment would push it past `max_tokens`. Until `min_tokens`
//! is reached segments keep being added, so a chunk may run past
//! `max_tokens` rather than close short. A segment larger than `max_tokens`
//! on its own becomes its own chunk.

use story_pipeline_core::SourceDocument;
use tracing::debug;

use crate::models::chunk::{Chunk, ChunkBudget, Segment, TokenEstimator};

/// Token-budgeted chunk planner
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    budget: ChunkBudget,
}

impl ChunkPlanner {
    pub fn new(budget: ChunkBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &ChunkBudget {
        &self.budget
    }

    /// Plan chunks over free text.
    ///
    /// With `overlap_tokens == 0` the chunks are disjoint and their texts
    /// concatenate back to `text`. Empty or whitespace-only input yields no
    /// chunks.
    pub fn plan(&self, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let segments = segment_text(text, self.budget.estimator);
        let chunks = self.accumulate(text, &segments, self.budget.overlap_tokens, None);
        debug!(
            segments = segments.len(),
            chunks = chunks.len(),
            overlap = self.budget.overlap_tokens,
            "planned chunks"
        );
        chunks
    }

    /// Plan disjoint chunks over a line-addressed document.
    ///
    /// Each line is atomic; chunk offsets refer to the lines joined with
    /// `\n`, and `row_ids` lists the line ids each chunk covers. Overlap is
    /// never applied.
    pub fn plan_document(&self, document: &SourceDocument) -> Vec<Chunk> {
        if document.is_blank() {
            return Vec::new();
        }

        let mut text = String::new();
        let mut segments = Vec::with_capacity(document.lines.len());
        let mut row_ids = Vec::with_capacity(document.lines.len());
        let last = document.lines.len() - 1;
        for (idx, line) in document.lines.iter().enumerate() {
            let start = text.len();
            text.push_str(&line.text);
            if idx < last {
                text.push('\n');
            }
            segments.push(Segment {
                start,
                end: text.len(),
                tokens: self.budget.estimator.estimate(&line.text),
            });
            row_ids.push(line.id);
        }

        self.accumulate(&text, &segments, 0, Some(&row_ids))
    }

    fn accumulate(
        &self,
        text: &str,
        segments: &[Segment],
        overlap_tokens: usize,
        row_ids: Option<&[u64]>,
    ) -> Vec<Chunk> {
        let budget = &self.budget;
        let mut spans: Vec<Span> = Vec::new();
        let mut next = 0;

        while next < segments.len() {
            if segments[next].tokens > budget.max_tokens {
                spans.push(Span {
                    first: next,
                    end: next + 1,
                    tokens: segments[next].tokens,
                    overlap: 0,
                });
                next += 1;
                continue;
            }

            let (mut first, mut overlap) = match spans.last() {
                Some(prev) if overlap_tokens > 0 => {
                    walk_back(segments, next, prev.first + 1, overlap_tokens)
                }
                _ => (next, 0),
            };
            if overlap + segments[next].tokens > budget.max_tokens {
                first = next;
                overlap = 0;
            }

            let mut tokens = overlap;
            let mut end = next;
            while end < segments.len() {
                let seg_tokens = segments[end].tokens;
                if end > next {
                    // Below min the ceiling only stops at a segment that is
                    // oversized on its own.
                    let min_met = tokens >= budget.min_tokens;
                    if seg_tokens > budget.max_tokens
                        || (min_met && tokens + seg_tokens > budget.max_tokens)
                        || (min_met && tokens >= budget.target_tokens)
                    {
                        break;
                    }
                }
                tokens += seg_tokens;
                end += 1;
            }

            spans.push(Span {
                first,
                end,
                tokens,
                overlap,
            });
            next = end;
        }

        // Fold a short tail into its predecessor when the budget allows it.
        if spans.len() > 1 {
            let tail = spans[spans.len() - 1];
            let prev = spans[spans.len() - 2];
            let tail_new = tail.tokens - tail.overlap;
            if tail_new < budget.min_tokens && prev.tokens + tail_new <= budget.max_tokens {
                spans.pop();
                if let Some(last) = spans.last_mut() {
                    last.end = tail.end;
                    last.tokens += tail_new;
                }
            }
        }

        spans
            .into_iter()
            .enumerate()
            .map(|(index, span)| {
                let start = segments[span.first].start;
                let stop = segments[span.end - 1].end;
                Chunk {
                    index,
                    start,
                    end: stop,
                    token_count: span.tokens,
                    overlap_tokens: span.overlap,
                    row_ids: row_ids
                        .map(|ids| ids[span.first..span.end].to_vec())
                        .unwrap_or_default(),
                    text: text[start..stop].to_string(),
                }
            })
            .collect()
    }
}

/// Segment range of one planned chunk, overlap included.
#[derive(Debug, Clone, Copy)]
struct Span {
    first: usize,
    end: usize,
    tokens: usize,
    overlap: usize,
}

/// Walk backward from `from` (exclusive) toward `floor` (inclusive) until at
/// least `wanted` tokens are re-included. Returns the first segment index and
/// the tokens re-included.
fn walk_back(segments: &[Segment], from: usize, floor: usize, wanted: usize) -> (usize, usize) {
    let mut first = from;
    let mut tokens = 0;
    while first > floor && tokens < wanted {
        first -= 1;
        tokens += segments[first].tokens;
    }
    (first, tokens)
}

/// Decompose text into contiguous segments at hard boundaries.
///
/// A segment ends after a line break, or after a run of `.`, `!`, `?`
/// (plus closing quotes/brackets and trailing spaces) that is followed by
/// whitespace or end of input. Segments cover the text exactly.
pub fn segment_text(text: &str, estimator: TokenEstimator) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        let mut end = None;
        if ch == '\n' {
            end = Some(idx + ch.len_utf8());
        } else if is_terminal_punct(ch) {
            let mut cursor = idx + ch.len_utf8();
            while let Some(&(next_idx, next)) = chars.peek() {
                if is_terminal_punct(next) || is_closing(next) {
                    cursor = next_idx + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            match chars.peek() {
                None => end = Some(cursor),
                Some(&(_, next)) if next.is_whitespace() => {
                    while let Some(&(next_idx, next)) = chars.peek() {
                        if next == ' ' || next == '\t' {
                            cursor = next_idx + next.len_utf8();
                            chars.next();
                        } else if next == '\n' {
                            cursor = next_idx + 1;
                            chars.next();
                            break;
                        } else {
                            break;
                        }
                    }
                    end = Some(cursor);
                }
                _ => {}
            }
        }

        if let Some(end) = end {
            segments.push(Segment {
                start,
                end,
                tokens: estimator.estimate(&text[start..end]),
            });
            start = end;
        }
    }

    if start < text.len() {
        segments.push(Segment {
            start,
            end: text.len(),
            tokens: estimator.estimate(&text[start..]),
        });
    }

    segments
}

fn is_terminal_punct(ch: char) -> bool {
    matches!(ch, '.' | '!' | '?' | '。' | '！' | '？')
}

fn is_closing(ch: char) -> bool {
    matches!(ch, '"' | '\'' | ')' | ']' | '”' | '’' | '」' | '』')
}
