//! Chunk Planning and Merging Integration Tests
//!
//! Verifies the planner's budget guarantees over realistic input sizes and
//! the merger's overlap elision.

use story_pipeline::models::chunk::{ChunkBudget, TokenEstimator};
use story_pipeline::services::chunking::{
    merge_overlay, parse_annotations, ChunkPlanner, OverlapMerger, PARAGRAPH_SEPARATOR,
};
use story_pipeline_core::SourceDocument;

use crate::support::filler;

fn default_planner() -> ChunkPlanner {
    ChunkPlanner::new(ChunkBudget::new(1000, 1500, 2000))
}

// ============================================================================
// Planner
// ============================================================================

#[test]
fn test_ten_thousand_tokens_yield_six_or_seven_chunks() {
    let text = filler(10_000, 10);
    let chunks = default_planner().plan(&text);
    assert!(
        (6..=7).contains(&chunks.len()),
        "expected 6-7 chunks, got {}",
        chunks.len()
    );
}

#[test]
fn test_chunk_sizes_within_budget_except_last() {
    let text = filler(10_000, 13);
    let chunks = default_planner().plan(&text);
    let (last, rest) = chunks.split_last().unwrap();
    for chunk in rest {
        assert!(
            (1000..=2000).contains(&chunk.token_count),
            "chunk {} has {} tokens",
            chunk.index,
            chunk.token_count
        );
    }
    assert!(last.token_count <= 2000);
}

#[test]
fn test_disjoint_chunks_reconstruct_source() {
    let text = format!("{}\nA new line starts here!\n\n{}", filler(3_000, 7), filler(2_500, 11));
    let chunks = default_planner().plan(&text);

    let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(rebuilt, text);

    let mut expected_start = 0;
    for chunk in &chunks {
        assert_eq!(chunk.start, expected_start);
        assert!(chunk.end > chunk.start);
        assert_eq!(chunk.overlap_tokens, 0);
        expected_start = chunk.end;
    }
    assert_eq!(expected_start, text.len());
}

#[test]
fn test_overlap_reincludes_previous_tail() {
    let budget = ChunkBudget::new(100, 150, 200).with_overlap(30);
    let text = filler(1_000, 10);
    let chunks = ChunkPlanner::new(budget).plan(&text);
    assert!(chunks.len() > 2);

    for pair in chunks.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        assert!(next.start < prev.end, "chunk {} does not overlap", next.index);
        assert!(next.start > prev.start);
        assert!(next.overlap_tokens >= 30);
        assert!(next.token_count <= 200);
    }
    assert_eq!(chunks.last().unwrap().end, text.len());
}

#[test]
fn test_oversized_segment_is_its_own_chunk() {
    let long_sentence = filler(300, 300);
    let text = format!("{} {}", filler(50, 10), long_sentence);
    let chunks = ChunkPlanner::new(ChunkBudget::new(40, 60, 100)).plan(&text);

    let big = chunks.iter().find(|c| c.token_count == 300).unwrap();
    assert!(big.text.trim_end().ends_with("w299."));
}

#[test]
fn test_empty_input_yields_no_chunks() {
    assert!(default_planner().plan("").is_empty());
    assert!(default_planner().plan(" \n\t\n ").is_empty());
}

#[test]
fn test_chars_per_token_estimator() {
    let budget = ChunkBudget::new(10, 20, 30).with_estimator(TokenEstimator::CharsPerToken(4.0));
    let text = "abcd efgh. ".repeat(40);
    let chunks = ChunkPlanner::new(budget).plan(&text);
    assert!(chunks.len() > 1);
    for chunk in &chunks[..chunks.len() - 1] {
        assert!(chunk.token_count <= 30);
    }
}

#[test]
fn test_document_chunks_track_line_ids() {
    let doc = SourceDocument::from_text(
        "d1",
        &(1..=40)
            .map(|n| format!("Line {} has five words.", n))
            .collect::<Vec<_>>()
            .join("\n"),
    );
    let chunks = ChunkPlanner::new(ChunkBudget::new(20, 30, 40)).plan_document(&doc);

    let ids: Vec<u64> = chunks.iter().flat_map(|c| c.row_ids.clone()).collect();
    assert_eq!(ids, (1..=40).collect::<Vec<u64>>());
}

// ============================================================================
// Merger
// ============================================================================

#[test]
fn test_merge_removes_longest_bounded_overlap() {
    let merger = OverlapMerger::new(500, 5);
    let merged = merger.merge(&[
        "The rain fell on the old roof. The cat slept.",
        "The cat slept. Morning came slowly.",
    ]);
    assert_eq!(merged, "The rain fell on the old roof. The cat slept. Morning came slowly.");
}

#[test]
fn test_merge_is_idempotent_on_disjoint_outputs() {
    let merger = OverlapMerger::default();
    let outputs = ["First scene ends here.", "Second scene begins elsewhere."];
    let merged = merger.merge(&outputs);
    assert_eq!(
        merged,
        format!("{}{}{}", outputs[0], PARAGRAPH_SEPARATOR, outputs[1])
    );
    assert_eq!(merger.merge(&[merged.as_str()]), merged);
}

#[test]
fn test_merge_search_is_bounded() {
    let shared = "x".repeat(50);
    let prev = format!("start {}", shared);
    let next = format!("{} end", shared);
    let bounded = OverlapMerger::new(10, 5);
    assert_eq!(bounded.overlap_len(&prev, &next), 10);
    let unbounded = OverlapMerger::new(1000, 5);
    assert_eq!(unbounded.overlap_len(&prev, &next), 50);
}

#[test]
fn test_overlay_merge_never_rewrites_text() {
    let doc = SourceDocument::from_text("d1", "Hello there.\nGeneral Kenobi.");
    let overlay = parse_annotations("2| [GRIEVOUS]\nnot a line\n7| [IGNORED]");
    let merged = merge_overlay(&doc, &overlay);
    assert_eq!(merged, "Hello there.\n[GRIEVOUS] General Kenobi.");
}
