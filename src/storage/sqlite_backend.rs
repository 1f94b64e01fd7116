//! The embedded-file `Store` implementation: a synchronous `rusqlite`-backed
//! `StorageBackend` adapted to the async `Store` trait. Every method runs the
//! underlying `rusqlite` call under `tokio::task::spawn_blocking` since
//! rusqlite itself is synchronous.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::connection::SqliteStorage;
use super::{entity_queries, graph_queries, queries, DbAccess, RelatedMemory, Store, TraversalStep};
use crate::error::{MementoError, Result};
use crate::types::{
    Embedding, Entity, EnrichmentPatch, ListOptions, Memory, MemoryEdit, MemoryId, MemoryStatus,
    Page, Relationship, UnknownTypeStat, UserSettings,
};

/// Store backed by a single embedded SQLite file (§4.1). The engine is
/// expected to size `NumWorkers = 1` for this backend (§5) to avoid writer
/// contention; the backend itself tolerates interleaved readers regardless.
pub struct SqliteBackend {
    storage: SqliteStorage,
}

impl SqliteBackend {
    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self {
            storage: SqliteStorage::open(db_path)?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            storage: SqliteStorage::open_in_memory()?,
        })
    }

    /// Exposes the pooled connection for `DbAccess`-style callers that need
    /// raw SQL (activity buckets, maintenance).
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    fn check_cancelled(token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(MementoError::Internal("operation cancelled".to_string()));
        }
        Ok(())
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SqliteStorage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|e| MementoError::Internal(format!("blocking task panicked: {e}")))?
    }
}

#[async_trait]
impl Store for SqliteBackend {
    async fn store(&self, m: Memory, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        self.blocking(move |s| s.with_connection(|conn| queries::insert_memory(conn, &m)))
            .await
    }

    async fn get(&self, id: &MemoryId, token: &CancellationToken) -> Result<Memory> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| s.with_connection(|conn| queries::get_memory(conn, &id)))
            .await
    }

    async fn list(&self, opts: &ListOptions, token: &CancellationToken) -> Result<Page<Memory>> {
        Self::check_cancelled(token)?;
        let opts = opts.clone();
        self.blocking(move |s| {
            s.with_connection(|conn| {
                let (items, total) = queries::list_memories(conn, &opts)?;
                let limit = opts.clamped_limit();
                let has_more = opts.offset + items.len() as i64 < total;
                Ok(Page {
                    items,
                    total,
                    limit,
                    has_more,
                })
            })
        })
        .await
    }

    async fn update(&self, id: &MemoryId, edit: MemoryEdit, token: &CancellationToken) -> Result<Memory> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| s.with_connection(|conn| queries::apply_memory_edit(conn, &id, &edit)))
            .await
    }

    async fn update_status(
        &self,
        id: &MemoryId,
        status: MemoryStatus,
        token: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| s.with_connection(|conn| queries::update_status(conn, &id, status)))
            .await
    }

    async fn update_enrichment(
        &self,
        id: &MemoryId,
        patch: EnrichmentPatch,
        token: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| {
            s.with_connection(|conn| queries::apply_enrichment_patch(conn, &id, &patch))
        })
        .await
    }

    async fn increment_access_count(&self, id: &MemoryId, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| s.with_connection(|conn| queries::increment_access_count(conn, &id)))
            .await
    }

    async fn update_decay_scores(&self, token: &CancellationToken) -> Result<i64> {
        Self::check_cancelled(token)?;
        self.blocking(move |s| s.with_connection(queries::update_decay_scores)).await
    }

    async fn delete(&self, id: &MemoryId, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| s.with_connection(|conn| queries::soft_delete(conn, &id)))
            .await
    }

    async fn restore(&self, id: &MemoryId, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| s.with_connection(|conn| queries::restore(conn, &id)))
            .await
    }

    async fn purge(&self, id: &MemoryId, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| s.with_connection(|conn| queries::purge(conn, &id)))
            .await
    }

    async fn get_related_memories(
        &self,
        id: &MemoryId,
        token: &CancellationToken,
    ) -> Result<Vec<RelatedMemory>> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| {
            s.with_connection(|conn| {
                let pairs = entity_queries::related_memory_ids(conn, &id)?;
                pairs
                    .into_iter()
                    .map(|(other_id, shared_entities)| {
                        let memory = queries::get_memory(conn, &other_id)?;
                        Ok(RelatedMemory {
                            memory,
                            shared_entities,
                        })
                    })
                    .collect()
            })
        })
        .await
    }

    async fn traverse(
        &self,
        start: &MemoryId,
        max_hops: u32,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<TraversalStep>> {
        Self::check_cancelled(token)?;
        let start = start.clone();
        self.blocking(move |s| {
            s.with_connection(|conn| graph_queries::traverse(conn, &start, max_hops, limit))
        })
        .await
    }

    async fn get_memory_entities(&self, id: &MemoryId, token: &CancellationToken) -> Result<Vec<Entity>> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| s.with_connection(|conn| entity_queries::entities_for_memory(conn, &id)))
            .await
    }

    async fn get_evolution_chain(&self, id: &MemoryId, token: &CancellationToken) -> Result<Vec<Memory>> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        self.blocking(move |s| s.with_connection(|conn| graph_queries::evolution_chain(conn, &id)))
            .await
    }

    async fn get_memories_by_relation_type(
        &self,
        id: &MemoryId,
        relation_type: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Memory>> {
        Self::check_cancelled(token)?;
        let id = id.clone();
        let relation_type = relation_type.to_string();
        self.blocking(move |s| {
            s.with_connection(|conn| graph_queries::memories_by_relation_type(conn, &id, &relation_type))
        })
        .await
    }

    async fn create_entity(&self, entity: Entity, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        self.blocking(move |s| s.with_connection(|conn| entity_queries::insert_entity(conn, &entity)))
            .await
    }

    async fn link_memory_entity(
        &self,
        memory_id: &MemoryId,
        entity_id: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(token)?;
        let memory_id = memory_id.clone();
        let entity_id = entity_id.to_string();
        self.blocking(move |s| {
            s.with_connection(|conn| entity_queries::link_memory_entity(conn, &memory_id, &entity_id))
        })
        .await
    }

    async fn get_entity(&self, entity_id: &str, token: &CancellationToken) -> Result<Entity> {
        Self::check_cancelled(token)?;
        let entity_id = entity_id.to_string();
        self.blocking(move |s| s.with_connection(|conn| entity_queries::get_entity(conn, &entity_id)))
            .await
    }

    async fn create_relationship(&self, rel: Relationship, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        self.blocking(move |s| {
            s.with_connection(|conn| entity_queries::insert_relationship(conn, &rel))
        })
        .await
    }

    async fn relationships_touching(
        &self,
        entity_ids: &[String],
        token: &CancellationToken,
    ) -> Result<Vec<Relationship>> {
        Self::check_cancelled(token)?;
        let entity_ids = entity_ids.to_vec();
        self.blocking(move |s| {
            s.with_connection(|conn| entity_queries::relationships_touching(conn, &entity_ids))
        })
        .await
    }

    async fn record_unknown_type(&self, type_name: &str, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let type_name = type_name.to_string();
        self.blocking(move |s| s.with_connection(|conn| queries::record_unknown_type(conn, &type_name)))
            .await
    }

    async fn unknown_type_stats(&self, token: &CancellationToken) -> Result<Vec<UnknownTypeStat>> {
        Self::check_cancelled(token)?;
        self.blocking(move |s| s.with_connection(queries::unknown_type_stats)).await
    }

    async fn store_embedding(&self, embedding: Embedding, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        self.blocking(move |s| s.with_connection(|conn| queries::upsert_embedding(conn, &embedding)))
            .await
    }

    async fn get_embedding(
        &self,
        memory_id: &MemoryId,
        model_name: &str,
        token: &CancellationToken,
    ) -> Result<Option<Embedding>> {
        Self::check_cancelled(token)?;
        let memory_id = memory_id.clone();
        let model_name = model_name.to_string();
        self.blocking(move |s| {
            s.with_connection(|conn| queries::get_embedding(conn, &memory_id, &model_name))
        })
        .await
    }

    async fn memories_missing_embeddings(
        &self,
        model_name: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<MemoryId>> {
        Self::check_cancelled(token)?;
        let model_name = model_name.to_string();
        self.blocking(move |s| {
            s.with_connection(|conn| queries::memories_missing_embeddings(conn, &model_name, limit))
        })
        .await
    }

    async fn save_setting(&self, key: &str, value: &str, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let key = key.to_string();
        let value = value.to_string();
        self.blocking(move |s| s.with_connection(|conn| queries::save_setting(conn, &key, &value)))
            .await
    }

    async fn load_setting(&self, key: &str, token: &CancellationToken) -> Result<Option<String>> {
        Self::check_cancelled(token)?;
        let key = key.to_string();
        self.blocking(move |s| s.with_connection(|conn| queries::load_setting(conn, &key)))
            .await
    }

    async fn load_all_settings(&self, token: &CancellationToken) -> Result<UserSettings> {
        Self::check_cancelled(token)?;
        self.blocking(move |s| s.with_connection(queries::load_all_settings)).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DbAccess for SqliteBackend {
    async fn activity_counts(
        &self,
        since: chrono::DateTime<chrono::Utc>,
        bucket_width_secs: i64,
        token: &CancellationToken,
    ) -> Result<Vec<(i64, i64)>> {
        Self::check_cancelled(token)?;
        self.blocking(move |s| {
            s.with_connection(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT (CAST(strftime('%s', created_at) AS INTEGER) / ?1) * ?1 AS bucket, count(*)
                     FROM memories
                     WHERE created_at >= ?2 AND deleted_at IS NULL
                     GROUP BY bucket
                     ORDER BY bucket",
                )?;
                let rows: Vec<(i64, i64)> = stmt
                    .query_map(
                        rusqlite::params![bucket_width_secs, since.to_rfc3339()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
        })
        .await
    }

    async fn entity_memory_counts(
        &self,
        entity_ids: &[String],
        token: &CancellationToken,
    ) -> Result<std::collections::HashMap<String, i64>> {
        Self::check_cancelled(token)?;
        let entity_ids = entity_ids.to_vec();
        self.blocking(move |s| {
            s.with_connection(|conn| {
                let mut counts = std::collections::HashMap::new();
                for entity_id in &entity_ids {
                    let count = entity_queries::entity_memory_count(conn, entity_id)?;
                    counts.insert(entity_id.clone(), count);
                }
                Ok(counts)
            })
        })
        .await
    }

    async fn search_entities(
        &self,
        query: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<crate::types::Entity>> {
        Self::check_cancelled(token)?;
        let query = query.to_string();
        self.blocking(move |s| s.with_connection(|conn| entity_queries::search_entities(conn, &query, limit)))
            .await
    }

    async fn search_relationships(
        &self,
        query: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<crate::types::Relationship>> {
        Self::check_cancelled(token)?;
        let query = query.to_string();
        self.blocking(move |s| s.with_connection(|conn| entity_queries::search_relationships(conn, &query, limit)))
            .await
    }
}

#[async_trait]
impl super::Overlay for SqliteBackend {
    async fn load_overlay(
        &self,
        connection_id: &str,
        token: &CancellationToken,
    ) -> Result<crate::types::SettingsOverlay> {
        Self::check_cancelled(token)?;
        let connection_id = connection_id.to_string();
        self.blocking(move |s| {
            s.with_connection(|conn| crate::connections::settings_overlay::SettingsOverlayStore::load(conn, &connection_id))
        })
        .await
    }

    async fn save_overlay(&self, overlay: &crate::types::SettingsOverlay, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let overlay = overlay.clone();
        self.blocking(move |s| {
            s.with_connection(|conn| crate::connections::settings_overlay::SettingsOverlayStore::save(conn, &overlay))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let m = Memory::new("default", "hello");
        let id = m.id.clone();
        backend.store(m, &token()).await.unwrap();
        let fetched = backend.get(&id, &token()).await.unwrap();
        assert_eq!(fetched.content, "hello");
    }

    #[tokio::test]
    async fn embedding_write_marks_stage_done() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let m = Memory::new("default", "hello");
        let id = m.id.clone();
        backend.store(m, &token()).await.unwrap();
        backend
            .store_embedding(Embedding::new(id.clone(), "nomic", vec![0.1, 0.2]), &token())
            .await
            .unwrap();
        let fetched = backend.get(&id, &token()).await.unwrap();
        assert_eq!(fetched.embedding_status, crate::types::StageStatus::Done);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let tok = CancellationToken::new();
        tok.cancel();
        let m = Memory::new("default", "hello");
        let result = backend.store(m, &tok).await;
        assert!(result.is_err());
    }
}
