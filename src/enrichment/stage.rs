//! Per-stage execution (§4.5): entity extraction, relationship extraction,
//! embedding. Each stage persists its outcome via a narrow `UpdateEnrichment`
//! write as soon as it completes, so a crash preserves partial progress.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::capability::{Embedder, LlmExtractor};
use crate::storage::Store;
use crate::types::{Embedding, Entity, MemoryId, Relationship, StageStatus};

/// A distinguished error text marking relationship extraction as skipped
/// because entity extraction failed first (§4.5: "marked Skipped (represented
/// as Failed with a distinguished error)").
pub const RELATIONSHIPS_SKIPPED: &str = "skipped: entity extraction failed";

/// Entity extraction outcome, carried between stages so relationship
/// extraction can resolve names to ids without re-querying the store.
pub struct EntityOutcome {
    pub status: StageStatus,
    pub entities_by_name: HashMap<String, Entity>,
    pub error: Option<String>,
}

/// Run entity extraction, validate each extracted type against `valid_types`
/// (types outside it are counted via `record_unknown_type` and dropped, §4.5),
/// persist links for the ones that land, and report the stage outcome.
pub async fn run_entity_stage(
    store: &Arc<dyn Store>,
    extractor: &Arc<dyn LlmExtractor>,
    memory_id: &MemoryId,
    content: &str,
    valid_types: &[String],
    token: &CancellationToken,
) -> EntityOutcome {
    let extracted = match extractor.extract_entities(content).await {
        Ok(entities) => entities,
        Err(err) => {
            warn!(%memory_id, %err, "entity extraction stage failed");
            return EntityOutcome {
                status: StageStatus::Failed,
                entities_by_name: HashMap::new(),
                error: Some(err.to_string()),
            };
        }
    };

    let mut entities_by_name = HashMap::new();
    for (name, entity_type) in extracted {
        if !valid_types.iter().any(|t| t == &entity_type) {
            if let Err(err) = store.record_unknown_type(&entity_type, token).await {
                warn!(%err, %entity_type, "failed to record unknown entity type");
            }
            continue;
        }
        let entity = Entity::new(name.clone(), entity_type);
        if let Err(err) = store.create_entity(entity.clone(), token).await {
            warn!(%err, %name, "failed to persist extracted entity");
            continue;
        }
        if let Err(err) = store.link_memory_entity(memory_id, &entity.id, token).await {
            warn!(%err, %name, "failed to link memory to entity");
            continue;
        }
        entities_by_name.insert(name, entity);
    }

    EntityOutcome {
        status: StageStatus::Done,
        entities_by_name,
        error: None,
    }
}

/// Run relationship extraction, attempted only after entities succeed (§4.5).
/// If `entity_outcome` failed, returns `Failed` immediately with
/// [`RELATIONSHIPS_SKIPPED`] rather than calling the provider.
pub async fn run_relationship_stage(
    store: &Arc<dyn Store>,
    extractor: &Arc<dyn LlmExtractor>,
    content: &str,
    entity_outcome: &EntityOutcome,
    valid_types: &[String],
    token: &CancellationToken,
) -> (StageStatus, Option<String>) {
    if entity_outcome.status != StageStatus::Done {
        return (StageStatus::Failed, Some(RELATIONSHIPS_SKIPPED.to_string()));
    }
    if entity_outcome.entities_by_name.is_empty() {
        return (StageStatus::Done, None);
    }

    let entity_pairs: Vec<(String, String)> = entity_outcome
        .entities_by_name
        .iter()
        .map(|(name, e)| (name.clone(), e.entity_type.clone()))
        .collect();

    let extracted = match extractor.extract_relationships(content, &entity_pairs).await {
        Ok(rels) => rels,
        Err(err) => return (StageStatus::Failed, Some(err.to_string())),
    };

    for (src_name, tgt_name, rel_type, weight) in extracted {
        if !valid_types.iter().any(|t| t == &rel_type) {
            continue;
        }
        let (Some(src), Some(tgt)) = (
            entity_outcome.entities_by_name.get(&src_name),
            entity_outcome.entities_by_name.get(&tgt_name),
        ) else {
            continue;
        };
        let mut rel = Relationship::new(src.id.clone(), tgt.id.clone(), rel_type);
        rel.weight = weight.clamp(0.0, 1.0);
        if let Err(err) = store.create_relationship(rel, token).await {
            warn!(%err, "failed to persist extracted relationship");
        }
    }

    (StageStatus::Done, None)
}

/// Compute and persist the embedding for one memory under `model_name` (§4.5).
pub async fn run_embedding_stage(
    store: &Arc<dyn Store>,
    embedder: &Arc<dyn Embedder>,
    memory_id: &MemoryId,
    content: &str,
    token: &CancellationToken,
) -> (StageStatus, Option<String>) {
    match embedder.embed(content).await {
        Ok(vector) => {
            let embedding = Embedding::new(memory_id.clone(), embedder.model_name(), vector);
            match store.store_embedding(embedding, token).await {
                Ok(()) => (StageStatus::Done, None),
                Err(err) => (StageStatus::Failed, Some(err.to_string())),
            }
        }
        Err(err) => (StageStatus::Failed, Some(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::capability::{HashEmbedder, NaiveExtractor};
    use crate::storage::SqliteBackend;
    use crate::types::Memory;

    fn taxonomy() -> Vec<String> {
        vec!["concept".to_string(), "person".to_string()]
    }

    #[tokio::test]
    async fn entity_stage_links_valid_types_and_counts_unknown() {
        let store: Arc<dyn Store> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let extractor: Arc<dyn LlmExtractor> = Arc::new(NaiveExtractor);
        let token = CancellationToken::new();
        let memory = Memory::new("default", "Go is a language built at Google");
        store.store(memory.clone(), &token).await.unwrap();

        let outcome =
            run_entity_stage(&store, &extractor, &memory.id, &memory.content, &taxonomy(), &token).await;
        assert_eq!(outcome.status, StageStatus::Done);
        assert!(outcome.entities_by_name.contains_key("Go"));

        let linked = store.get_memory_entities(&memory.id, &token).await.unwrap();
        assert!(!linked.is_empty());
    }

    #[tokio::test]
    async fn relationship_stage_skips_when_entities_failed() {
        let store: Arc<dyn Store> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let extractor: Arc<dyn LlmExtractor> = Arc::new(NaiveExtractor);
        let token = CancellationToken::new();
        let failed_outcome = EntityOutcome {
            status: StageStatus::Failed,
            entities_by_name: HashMap::new(),
            error: Some("boom".to_string()),
        };
        let (status, error) =
            run_relationship_stage(&store, &extractor, "content", &failed_outcome, &taxonomy(), &token)
                .await;
        assert_eq!(status, StageStatus::Failed);
        assert_eq!(error.as_deref(), Some(RELATIONSHIPS_SKIPPED));
    }

    #[tokio::test]
    async fn embedding_stage_writes_one_row() {
        let store: Arc<dyn Store> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new("test-model", 8));
        let token = CancellationToken::new();
        let memory = Memory::new("default", "some content");
        store.store(memory.clone(), &token).await.unwrap();

        let (status, error) = run_embedding_stage(&store, &embedder, &memory.id, &memory.content, &token).await;
        assert_eq!(status, StageStatus::Done);
        assert!(error.is_none());

        let fetched = store.get_embedding(&memory.id, "test-model", &token).await.unwrap();
        assert!(fetched.is_some());
    }
}
