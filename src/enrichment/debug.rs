//! `DebugOrchestrator` (§4.5): a read-only "what would retrieval do" trace,
//! in the style of an `explain_ranking` diagnostic but built directly against
//! [`crate::search::score::score_memory`] so the trace can never diverge from
//! what the runtime search path actually does.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::search::score::{score_memory, ScoreBreakdown};
use crate::storage::Store;
use crate::types::{ListOptions, MemoryId};

/// Input to a debug recall run (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugRecallParams {
    pub query: String,
    pub domain: Option<String>,
    pub limit: usize,
    pub min_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateTrace {
    pub id: MemoryId,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredCandidate {
    pub id: MemoryId,
    pub reason: String,
}

/// The structured trace returned to callers (§4.5). Invariant 5 (§8):
/// `returned` and `filtered_out` are disjoint, and every returned id's total
/// score is ≥ `min_score`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugRecallTrace {
    pub query_params: DebugRecallParams,
    pub candidates_found: usize,
    pub scored_results: Vec<CandidateTrace>,
    pub filtered_out: Vec<FilteredCandidate>,
    pub returned: Vec<MemoryId>,
    pub timing_ms: u64,
}

/// Read-only companion to [`crate::enrichment::MemoryEngine`] that replays
/// ranking without mutating anything.
pub struct DebugOrchestrator {
    store: Arc<dyn Store>,
}

impl DebugOrchestrator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn debug_recall(
        &self,
        params: DebugRecallParams,
        token: &CancellationToken,
    ) -> Result<DebugRecallTrace> {
        let start = Instant::now();

        let opts = ListOptions {
            domain: params.domain.clone(),
            limit: 1000,
            ..Default::default()
        };
        let page = self.store.list(&opts, token).await?;

        let mut scored: Vec<(MemoryId, ScoreBreakdown)> = page
            .items
            .iter()
            .map(|memory| (memory.id.clone(), score_memory(memory, &params.query)))
            .collect();
        scored.sort_by(|a, b| b.1.total.partial_cmp(&a.1.total).unwrap_or(std::cmp::Ordering::Equal));

        let candidates_found = scored.len();
        let scored_results: Vec<CandidateTrace> = scored
            .iter()
            .map(|(id, breakdown)| CandidateTrace { id: id.clone(), breakdown: breakdown.clone() })
            .collect();

        let mut returned = Vec::new();
        let mut filtered_out = Vec::new();
        for (id, breakdown) in scored {
            if breakdown.total < params.min_score {
                filtered_out.push(FilteredCandidate { id, reason: "below min_score".to_string() });
                continue;
            }
            if returned.len() >= params.limit {
                filtered_out.push(FilteredCandidate { id, reason: "exceeds limit".to_string() });
                continue;
            }
            returned.push(id);
        }

        Ok(DebugRecallTrace {
            query_params: params,
            candidates_found,
            scored_results,
            filtered_out,
            returned,
            timing_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteBackend;
    use crate::types::Memory;

    #[tokio::test]
    async fn returned_and_filtered_out_are_disjoint_and_meet_min_score() {
        let store: Arc<dyn Store> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let token = CancellationToken::new();
        for content in ["Go programming language", "Rust ownership model", "unrelated text entirely"] {
            store.store(Memory::new("default", content), &token).await.unwrap();
        }

        let orchestrator = DebugOrchestrator::new(store);
        let trace = orchestrator
            .debug_recall(
                DebugRecallParams {
                    query: "Go programming".to_string(),
                    domain: Some("default".to_string()),
                    limit: 10,
                    min_score: 0.3,
                },
                &token,
            )
            .await
            .unwrap();

        let returned: std::collections::HashSet<_> = trace.returned.iter().collect();
        let filtered: std::collections::HashSet<_> = trace.filtered_out.iter().map(|f| &f.id).collect();
        assert!(returned.is_disjoint(&filtered));
        for id in &trace.returned {
            let entry = trace.scored_results.iter().find(|c| &c.id == id).unwrap();
            assert!(entry.breakdown.total >= 0.3);
        }
    }

    #[tokio::test]
    async fn limit_of_zero_filters_every_candidate() {
        let store: Arc<dyn Store> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let token = CancellationToken::new();
        store.store(Memory::new("default", "some content here"), &token).await.unwrap();

        let orchestrator = DebugOrchestrator::new(store);
        let trace = orchestrator
            .debug_recall(
                DebugRecallParams { query: "content".to_string(), domain: None, limit: 0, min_score: 0.0 },
                &token,
            )
            .await
            .unwrap();

        assert!(trace.returned.is_empty());
        assert_eq!(trace.filtered_out.len(), trace.candidates_found);
    }
}
