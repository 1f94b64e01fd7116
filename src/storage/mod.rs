//! The storage contract (§4.1, C1): a uniform `Store` trait every backend
//! implements, plus two optional capability traits a backend may additionally
//! satisfy (§9 "inheritance/duck typing → capability set").

mod connection;
pub mod entity_queries;
pub mod graph_queries;
pub mod migrations;
#[cfg(feature = "postgres")]
pub mod postgres_backend;
pub mod queries;
pub mod sqlite_backend;

pub use connection::{PooledConnection, SqliteStorage};
#[cfg(feature = "postgres")]
pub use postgres_backend::PostgresBackend;
pub use sqlite_backend::SqliteBackend;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{
    Embedding, Entity, EnrichmentPatch, ListOptions, Memory, MemoryEdit, MemoryId, MemoryStatus,
    Page, Relationship, UnknownTypeStat, UserSettings,
};

/// A memory reached via a shared entity, paired with the entity names that connect it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RelatedMemory {
    pub memory: Memory,
    pub shared_entities: Vec<String>,
}

/// One node/edge pair discovered while walking the graph outward from a memory (§4.1 `Traverse`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TraversalStep {
    pub memory: Memory,
    pub hop: u32,
    pub via_entity: String,
}

/// The operations every backend exposes (§4.1). All take a `CancellationToken`
/// and return a typed error. The teacher's `StorageBackend` trait
/// (`storage/backend.rs`) is synchronous, built for a single embedded SQLite
/// file; this generalizes it to async so stage calls to LLM/embedding
/// providers and cooperative cancellation can run without blocking the
/// enrichment worker pool.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert; fails if `m.id` already exists. Idempotence is the caller's responsibility.
    async fn store(&self, m: Memory, token: &CancellationToken) -> Result<()>;

    /// Fetch one; fails with `NotFound` if absent or soft-deleted.
    async fn get(&self, id: &MemoryId, token: &CancellationToken) -> Result<Memory>;

    /// Paginated scan with optional filters, sort key + direction (§4.1).
    async fn list(&self, opts: &ListOptions, token: &CancellationToken) -> Result<Page<Memory>>;

    /// Replace mutable fields of an existing row. `created_at` is never overwritten;
    /// `updated_at` is set to now.
    async fn update(&self, id: &MemoryId, edit: MemoryEdit, token: &CancellationToken) -> Result<Memory>;

    /// Narrow write used by clients/engine to change only the overall status.
    async fn update_status(
        &self,
        id: &MemoryId,
        status: MemoryStatus,
        token: &CancellationToken,
    ) -> Result<()>;

    /// Narrow write the engine uses mid-enrichment: only `Some` fields in `patch` change.
    async fn update_enrichment(
        &self,
        id: &MemoryId,
        patch: EnrichmentPatch,
        token: &CancellationToken,
    ) -> Result<()>;

    /// Atomic `access_count += 1`.
    async fn increment_access_count(&self, id: &MemoryId, token: &CancellationToken) -> Result<()>;

    /// Batch recomputation of `decay_score` over all memories. Returns count updated.
    async fn update_decay_scores(&self, token: &CancellationToken) -> Result<i64>;

    /// Soft delete, reversible by `restore`.
    async fn delete(&self, id: &MemoryId, token: &CancellationToken) -> Result<()>;

    /// Reverse a soft delete.
    async fn restore(&self, id: &MemoryId, token: &CancellationToken) -> Result<()>;

    /// Hard delete with cascaded join rows. Irreversible.
    async fn purge(&self, id: &MemoryId, token: &CancellationToken) -> Result<()>;

    /// Memories sharing at least one entity with `id`.
    async fn get_related_memories(
        &self,
        id: &MemoryId,
        token: &CancellationToken,
    ) -> Result<Vec<RelatedMemory>>;

    /// Breadth-first walk outward from a memory through its entities and
    /// relationships, deduplicated, bounded by both hops and result count.
    async fn traverse(
        &self,
        start: &MemoryId,
        max_hops: u32,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<TraversalStep>>;

    /// Entities linked to a memory via `memory_entities`.
    async fn get_memory_entities(&self, id: &MemoryId, token: &CancellationToken) -> Result<Vec<Entity>>;

    /// The chain of memories this one evolved from/into, newest last.
    async fn get_evolution_chain(&self, id: &MemoryId, token: &CancellationToken) -> Result<Vec<Memory>>;

    /// Memories reachable from `id` via relationships of exactly `relation_type`.
    async fn get_memories_by_relation_type(
        &self,
        id: &MemoryId,
        relation_type: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Memory>>;

    /// Create an entity (only called as a side effect of a successful enrichment stage).
    async fn create_entity(&self, entity: Entity, token: &CancellationToken) -> Result<()>;

    /// Link a memory to an entity, creating the `memory_entities` join row.
    async fn link_memory_entity(
        &self,
        memory_id: &MemoryId,
        entity_id: &str,
        token: &CancellationToken,
    ) -> Result<()>;

    /// Fetch an entity by id.
    async fn get_entity(&self, entity_id: &str, token: &CancellationToken) -> Result<Entity>;

    /// Create a directed relationship between two entities.
    async fn create_relationship(&self, rel: Relationship, token: &CancellationToken) -> Result<()>;

    /// Relationships touching any entity in `entity_ids`, for one BFS hop.
    async fn relationships_touching(
        &self,
        entity_ids: &[String],
        token: &CancellationToken,
    ) -> Result<Vec<Relationship>>;

    /// Record (or bump) an unrecognized entity-type name seen during extraction (§4.5).
    async fn record_unknown_type(&self, type_name: &str, token: &CancellationToken) -> Result<()>;

    /// Read back the `unknown_type_stats` counters.
    async fn unknown_type_stats(&self, token: &CancellationToken) -> Result<Vec<UnknownTypeStat>>;

    /// Write (or replace) the embedding row for (memory_id, model_name).
    async fn store_embedding(&self, embedding: Embedding, token: &CancellationToken) -> Result<()>;

    /// Fetch the embedding row for (memory_id, model_name), if present.
    async fn get_embedding(
        &self,
        memory_id: &MemoryId,
        model_name: &str,
        token: &CancellationToken,
    ) -> Result<Option<Embedding>>;

    /// Memories missing an embedding row for `model_name` (maintenance query, §4.1).
    async fn memories_missing_embeddings(
        &self,
        model_name: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<MemoryId>>;

    /// Upsert a process-wide setting.
    async fn save_setting(&self, key: &str, value: &str, token: &CancellationToken) -> Result<()>;

    /// Read a process-wide setting.
    async fn load_setting(&self, key: &str, token: &CancellationToken) -> Result<Option<String>>;

    /// Read the full settings map.
    async fn load_all_settings(&self, token: &CancellationToken) -> Result<UserSettings>;

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// A backend that can rank text matches with its own scoring function
/// (an external FTS index or `tsvector`/`ts_rank`), rather than falling back
/// to substring matching (§4.1, §4.6).
#[async_trait]
pub trait SearchProvider: Store {
    async fn full_text_search(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
        token: &CancellationToken,
    ) -> Result<Vec<Memory>>;
}

/// A backend that can store a per-connection taxonomy customization (§4.4).
/// Both backends implement this; it is split out from `Store` because the
/// overlay lives in its own table and is queried independently of any one
/// memory.
#[async_trait]
pub trait Overlay: Store {
    async fn load_overlay(&self, connection_id: &str, token: &CancellationToken) -> Result<crate::types::SettingsOverlay>;

    async fn save_overlay(&self, overlay: &crate::types::SettingsOverlay, token: &CancellationToken) -> Result<()>;
}

/// A backend that can expose activity-bucket and maintenance queries requiring
/// direct SQL access (§4.1, §4.6).
#[async_trait]
pub trait DbAccess: Store {
    /// Counts bucketed by `(epoch_seconds / width) * width`, over `[since, now)`.
    async fn activity_counts(
        &self,
        since: chrono::DateTime<chrono::Utc>,
        bucket_width_secs: i64,
        token: &CancellationToken,
    ) -> Result<Vec<(i64, i64)>>;

    /// `memory_entities` row count per entity id, for populating `Entity.memory_count`
    /// on the entity-neighborhood graph view (§4.6).
    async fn entity_memory_counts(
        &self,
        entity_ids: &[String],
        token: &CancellationToken,
    ) -> Result<std::collections::HashMap<String, i64>>;

    /// Entities whose name matches `query` (§4.6 supplemental search matches).
    async fn search_entities(&self, query: &str, limit: usize, token: &CancellationToken) -> Result<Vec<Entity>>;

    /// Relationships whose type matches `query` (§4.6 supplemental search matches).
    async fn search_relationships(
        &self,
        query: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<Relationship>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_memory_serializes() {
        let rm = RelatedMemory {
            memory: Memory::new("default", "hello"),
            shared_entities: vec!["Go".to_string()],
        };
        let json = serde_json::to_string(&rm).unwrap();
        assert!(json.contains("shared_entities"));
    }
}
