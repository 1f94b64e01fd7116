//! Relevance scoring shared by the runtime search path and the enrichment
//! engine's [`crate::enrichment::DebugOrchestrator`] (§4.5, §4.6), so a debug
//! trace can never diverge from what retrieval actually does. A from-scratch
//! scoring pipeline sized to the memory model in `types::memory`.

use serde::{Deserialize, Serialize};

use crate::types::Memory;

/// Per-component contribution to a candidate's total score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub text_match: f32,
    pub importance: f32,
    pub decay: f32,
    pub total: f32,
}

pub const TEXT_WEIGHT: f32 = 0.6;
pub const IMPORTANCE_WEIGHT: f32 = 0.25;
pub const DECAY_WEIGHT: f32 = 0.15;

/// Score one memory against `query`. An empty query scores text_match as 0,
/// so ranking degrades to importance/decay only (used by the graph/activity
/// surfaces which don't carry a query).
pub fn score_memory(memory: &Memory, query: &str) -> ScoreBreakdown {
    let text_match = text_match_score(&memory.content, query);
    let importance = memory.importance.clamp(0.0, 1.0);
    let decay = memory.decay_score.clamp(0.0, 1.0);
    let total = text_match * TEXT_WEIGHT + importance * IMPORTANCE_WEIGHT + decay * DECAY_WEIGHT;
    ScoreBreakdown { text_match, importance, decay, total }
}

/// Fraction of whitespace-separated query terms present in `content`
/// (case-insensitive), boosted to at least 0.5 when the whole query appears
/// as a contiguous substring.
fn text_match_score(content: &str, query: &str) -> f32 {
    let query = query.trim();
    if query.is_empty() {
        return 0.0;
    }
    let content_lower = content.to_lowercase();
    let query_lower = query.to_lowercase();
    let terms: Vec<&str> = query_lower.split_whitespace().collect();
    if terms.is_empty() {
        return 0.0;
    }
    let matched = terms.iter().filter(|t| content_lower.contains(*t)).count();
    let fraction = matched as f32 / terms.len() as f32;
    if content_lower.contains(&query_lower) {
        fraction.max(0.5)
    } else {
        fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Memory;

    #[test]
    fn exact_substring_match_scores_at_least_half_text_weight() {
        let memory = Memory::new("default", "Go is a compiled language");
        let breakdown = score_memory(&memory, "compiled language");
        assert!(breakdown.text_match >= 0.5);
    }

    #[test]
    fn no_term_overlap_scores_zero_text_match() {
        let memory = Memory::new("default", "Go is a compiled language");
        let breakdown = score_memory(&memory, "rust borrow checker");
        assert_eq!(breakdown.text_match, 0.0);
    }

    #[test]
    fn empty_query_has_no_text_component() {
        let memory = Memory::new("default", "anything");
        let breakdown = score_memory(&memory, "");
        assert_eq!(breakdown.text_match, 0.0);
        assert!(breakdown.total > 0.0);
    }
}
