//! The shared-server `Store` implementation, backed by `sqlx::PgPool`
//! (`PgPool::connect_with`, `#[derive(sqlx::FromRow)]` row structs,
//! `sqlx::query`/`query_as` idiom) implementing this crate's
//! memory/entity/relationship/embedding schema against the async `Store`
//! contract.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use super::migrations::run_postgres_migrations;
use super::{DbAccess, RelatedMemory, SearchProvider, Store, TraversalStep};
use crate::error::{MementoError, Result};
use crate::types::{
    vector_from_blob, vector_to_blob, Embedding, Entity, EnrichmentPatch, ListOptions, Memory,
    MemoryEdit, MemoryId, MemoryStatus, Page, Relationship, SortDirection, SortKey,
    UnknownTypeStat, UserSettings,
};

/// Store backed by a shared Postgres database (§4.1). Implements every
/// capability trait: full text search via a generated `tsvector` column, and
/// direct-SQL activity buckets.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await
            .map_err(MementoError::Postgres)?;
        run_postgres_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn check_cancelled(token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(MementoError::Internal("operation cancelled".to_string()));
        }
        Ok(())
    }
}

fn memory_from_row(row: &sqlx::postgres::PgRow) -> Result<Memory> {
    let id: String = row.try_get("id").map_err(MementoError::Postgres)?;
    let tags_json: serde_json::Value = row.try_get("tags").map_err(MementoError::Postgres)?;
    let metadata_json: serde_json::Value =
        row.try_get("metadata").map_err(MementoError::Postgres)?;
    let status: String = row.try_get("status").map_err(MementoError::Postgres)?;
    let entity_status: String = row.try_get("entity_status").map_err(MementoError::Postgres)?;
    let relationship_status: String = row
        .try_get("relationship_status")
        .map_err(MementoError::Postgres)?;
    let embedding_status: String = row
        .try_get("embedding_status")
        .map_err(MementoError::Postgres)?;

    Ok(Memory {
        id: MemoryId::from(id),
        content: row.try_get("content").map_err(MementoError::Postgres)?,
        source: row.try_get("source").map_err(MementoError::Postgres)?,
        tags: serde_json::from_value(tags_json).unwrap_or_default(),
        metadata: serde_json::from_value(metadata_json).unwrap_or_default(),
        timestamp: row.try_get("timestamp").map_err(MementoError::Postgres)?,
        created_at: row.try_get("created_at").map_err(MementoError::Postgres)?,
        updated_at: row.try_get("updated_at").map_err(MementoError::Postgres)?,
        created_by: row.try_get("created_by").map_err(MementoError::Postgres)?,
        importance: row.try_get("importance").map_err(MementoError::Postgres)?,
        access_count: row.try_get("access_count").map_err(MementoError::Postgres)?,
        decay_score: row.try_get("decay_score").map_err(MementoError::Postgres)?,
        status: status.parse().unwrap_or_default(),
        entity_status: entity_status.parse().unwrap_or_default(),
        relationship_status: relationship_status.parse().unwrap_or_default(),
        embedding_status: embedding_status.parse().unwrap_or_default(),
        enrichment_attempts: row
            .try_get("enrichment_attempts")
            .map_err(MementoError::Postgres)?,
        enrichment_error: row
            .try_get("enrichment_error")
            .map_err(MementoError::Postgres)?,
        enriched_at: row.try_get("enriched_at").map_err(MementoError::Postgres)?,
        deleted_at: row.try_get("deleted_at").map_err(MementoError::Postgres)?,
    })
}

fn entity_from_row(row: &sqlx::postgres::PgRow) -> Result<Entity> {
    Ok(Entity {
        id: row.try_get("id").map_err(MementoError::Postgres)?,
        name: row.try_get("name").map_err(MementoError::Postgres)?,
        entity_type: row.try_get("entity_type").map_err(MementoError::Postgres)?,
        description: row.try_get("description").map_err(MementoError::Postgres)?,
        created_at: row.try_get("created_at").map_err(MementoError::Postgres)?,
        memory_count: None,
    })
}

fn relationship_from_row(row: &sqlx::postgres::PgRow) -> Result<Relationship> {
    Ok(Relationship {
        id: row.try_get("id").map_err(MementoError::Postgres)?,
        source_id: row.try_get("source_id").map_err(MementoError::Postgres)?,
        target_id: row.try_get("target_id").map_err(MementoError::Postgres)?,
        relationship_type: row
            .try_get("relationship_type")
            .map_err(MementoError::Postgres)?,
        weight: row.try_get("weight").map_err(MementoError::Postgres)?,
        bidirectional: row.try_get("bidirectional").map_err(MementoError::Postgres)?,
        created_at: row.try_get("created_at").map_err(MementoError::Postgres)?,
    })
}

#[async_trait]
impl Store for PostgresBackend {
    async fn store(&self, m: Memory, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        sqlx::query(
            "INSERT INTO memories (
                id, content, source, tags, metadata, timestamp, created_at, updated_at,
                created_by, importance, access_count, decay_score, status,
                entity_status, relationship_status, embedding_status,
                enrichment_attempts, enrichment_error, enriched_at, deleted_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)",
        )
        .bind(m.id.as_str())
        .bind(&m.content)
        .bind(&m.source)
        .bind(serde_json::to_value(&m.tags)?)
        .bind(serde_json::to_value(&m.metadata)?)
        .bind(m.timestamp)
        .bind(m.created_at)
        .bind(m.updated_at)
        .bind(&m.created_by)
        .bind(m.importance)
        .bind(m.access_count)
        .bind(m.decay_score)
        .bind(m.status.as_str())
        .bind(m.entity_status.as_str())
        .bind(m.relationship_status.as_str())
        .bind(m.embedding_status.as_str())
        .bind(m.enrichment_attempts)
        .bind(&m.enrichment_error)
        .bind(m.enriched_at)
        .bind(m.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        Ok(())
    }

    async fn get(&self, id: &MemoryId, token: &CancellationToken) -> Result<Memory> {
        Self::check_cancelled(token)?;
        let row = sqlx::query("SELECT * FROM memories WHERE id=$1 AND deleted_at IS NULL")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(MementoError::Postgres)?
            .ok_or_else(|| MementoError::NotFound(id.to_string()))?;
        memory_from_row(&row)
    }

    async fn list(&self, opts: &ListOptions, token: &CancellationToken) -> Result<Page<Memory>> {
        Self::check_cancelled(token)?;
        let mut clauses = vec!["deleted_at IS NULL".to_string()];
        let mut idx = 1;
        let mut domain_pattern: Option<String> = None;
        let mut status_str: Option<String> = None;

        if let Some(domain) = &opts.domain {
            idx += 1;
            clauses.push(format!("id LIKE ${idx}"));
            domain_pattern = Some(format!("mem:{domain}:%"));
        }
        if let Some(status) = opts.status {
            idx += 1;
            clauses.push(format!("status = ${idx}"));
            status_str = Some(status.as_str().to_string());
        }
        let where_clause = clauses.join(" AND ");
        let sort_col = match opts.sort_key {
            SortKey::CreatedAt => "created_at",
            SortKey::UpdatedAt => "updated_at",
            SortKey::Importance => "importance",
            SortKey::DecayScore => "decay_score",
        };
        let direction = match opts.sort_direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        let limit = opts.clamped_limit();

        let count_sql = format!("SELECT count(*) FROM memories WHERE {where_clause}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(p) = &domain_pattern {
            count_query = count_query.bind(p);
        }
        if let Some(s) = &status_str {
            count_query = count_query.bind(s);
        }
        let total = count_query.fetch_one(&self.pool).await.map_err(MementoError::Postgres)?;

        let list_sql = format!(
            "SELECT * FROM memories WHERE {where_clause} ORDER BY {sort_col} {direction} LIMIT ${} OFFSET ${}",
            idx + 1,
            idx + 2
        );
        let mut list_query = sqlx::query(&list_sql);
        if let Some(p) = &domain_pattern {
            list_query = list_query.bind(p);
        }
        if let Some(s) = &status_str {
            list_query = list_query.bind(s);
        }
        list_query = list_query.bind(limit).bind(opts.offset.max(0));
        let rows = list_query.fetch_all(&self.pool).await.map_err(MementoError::Postgres)?;
        let mut items: Vec<Memory> = rows.iter().map(memory_from_row).collect::<Result<_>>()?;

        if let Some(wanted_tags) = &opts.tags {
            items.retain(|m| wanted_tags.iter().all(|t| m.tags.contains(t)));
        }

        let has_more = opts.offset + items.len() as i64 < total;
        Ok(Page {
            items,
            total,
            limit,
            has_more,
        })
    }

    async fn update(&self, id: &MemoryId, edit: MemoryEdit, token: &CancellationToken) -> Result<Memory> {
        Self::check_cancelled(token)?;
        let mut current = self.get(id, token).await?;
        if let Some(content) = edit.content {
            current.content = content;
        }
        if let Some(source) = edit.source {
            current.source = Some(source);
        }
        if let Some(tags) = edit.tags {
            current.tags = tags;
        }
        if let Some(metadata) = edit.metadata {
            current.metadata = metadata;
        }
        if let Some(importance) = edit.importance {
            current.importance = importance;
        }
        current.updated_at = Utc::now();

        sqlx::query(
            "UPDATE memories SET content=$1, source=$2, tags=$3, metadata=$4, importance=$5, updated_at=$6
             WHERE id=$7",
        )
        .bind(&current.content)
        .bind(&current.source)
        .bind(serde_json::to_value(&current.tags)?)
        .bind(serde_json::to_value(&current.metadata)?)
        .bind(current.importance)
        .bind(current.updated_at)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        Ok(current)
    }

    async fn update_status(
        &self,
        id: &MemoryId,
        status: MemoryStatus,
        token: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(token)?;
        let result = sqlx::query("UPDATE memories SET status=$1, updated_at=$2 WHERE id=$3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(MementoError::Postgres)?;
        if result.rows_affected() == 0 {
            return Err(MementoError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_enrichment(
        &self,
        id: &MemoryId,
        patch: EnrichmentPatch,
        token: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(token)?;
        let mut idx = 0u32;
        let mut next_param = || {
            idx += 1;
            format!("${idx}")
        };

        let mut fragments = Vec::new();
        if patch.entity_status.is_some() {
            fragments.push(format!("entity_status={}", next_param()));
        }
        if patch.relationship_status.is_some() {
            fragments.push(format!("relationship_status={}", next_param()));
        }
        if patch.embedding_status.is_some() {
            fragments.push(format!("embedding_status={}", next_param()));
        }
        if patch.status.is_some() {
            fragments.push(format!("status={}", next_param()));
        }
        if patch.enrichment_attempts.is_some() {
            fragments.push(format!("enrichment_attempts={}", next_param()));
        }
        if patch.enrichment_error.is_some() {
            fragments.push(format!("enrichment_error={}", next_param()));
        }
        if patch.enriched_at.is_some() {
            fragments.push(format!("enriched_at={}", next_param()));
        }
        if fragments.is_empty() {
            return Ok(());
        }
        fragments.push(format!("updated_at={}", next_param()));
        let id_param = next_param();
        let query_str = format!(
            "UPDATE memories SET {} WHERE id={}",
            fragments.join(", "),
            id_param
        );

        let mut q = sqlx::query(&query_str);
        if let Some(v) = patch.entity_status {
            q = q.bind(v.as_str());
        }
        if let Some(v) = patch.relationship_status {
            q = q.bind(v.as_str());
        }
        if let Some(v) = patch.embedding_status {
            q = q.bind(v.as_str());
        }
        if let Some(v) = patch.status {
            q = q.bind(v.as_str());
        }
        if let Some(v) = patch.enrichment_attempts {
            q = q.bind(v);
        }
        if let Some(v) = patch.enrichment_error {
            q = q.bind(v);
        }
        if let Some(v) = patch.enriched_at {
            q = q.bind(v);
        }
        q = q.bind(Utc::now());
        q = q.bind(id.as_str());

        let result = q.execute(&self.pool).await.map_err(MementoError::Postgres)?;
        if result.rows_affected() == 0 {
            return Err(MementoError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn increment_access_count(&self, id: &MemoryId, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let result = sqlx::query("UPDATE memories SET access_count = access_count + 1 WHERE id=$1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(MementoError::Postgres)?;
        if result.rows_affected() == 0 {
            return Err(MementoError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_decay_scores(&self, token: &CancellationToken) -> Result<i64> {
        Self::check_cancelled(token)?;
        let result = sqlx::query(
            "UPDATE memories SET decay_score = exp(-EXTRACT(EPOCH FROM (now() - created_at)) / 86400.0 / 30.0)
             WHERE deleted_at IS NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        Ok(result.rows_affected() as i64)
    }

    async fn delete(&self, id: &MemoryId, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let result = sqlx::query("UPDATE memories SET deleted_at=$1 WHERE id=$2 AND deleted_at IS NULL")
            .bind(Utc::now())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(MementoError::Postgres)?;
        if result.rows_affected() == 0 {
            return Err(MementoError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn restore(&self, id: &MemoryId, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let result = sqlx::query("UPDATE memories SET deleted_at=NULL WHERE id=$1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(MementoError::Postgres)?;
        if result.rows_affected() == 0 {
            return Err(MementoError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn purge(&self, id: &MemoryId, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        let result = sqlx::query("DELETE FROM memories WHERE id=$1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(MementoError::Postgres)?;
        if result.rows_affected() == 0 {
            return Err(MementoError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get_related_memories(
        &self,
        id: &MemoryId,
        token: &CancellationToken,
    ) -> Result<Vec<RelatedMemory>> {
        Self::check_cancelled(token)?;
        let rows = sqlx::query(
            "SELECT me2.memory_id AS other_id, e.name AS entity_name
             FROM memory_entities me1
             JOIN memory_entities me2 ON me2.entity_id = me1.entity_id AND me2.memory_id != me1.memory_id
             JOIN entities e ON e.id = me1.entity_id
             WHERE me1.memory_id = $1",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;

        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for row in &rows {
            let other_id: String = row.try_get("other_id").map_err(MementoError::Postgres)?;
            let entity_name: String = row.try_get("entity_name").map_err(MementoError::Postgres)?;
            grouped.entry(other_id).or_default().push(entity_name);
        }

        let mut out = Vec::new();
        for (other_id, shared_entities) in grouped {
            let memory = self.get(&MemoryId::from(other_id), token).await?;
            out.push(RelatedMemory {
                memory,
                shared_entities,
            });
        }
        Ok(out)
    }

    async fn traverse(
        &self,
        start: &MemoryId,
        max_hops: u32,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<TraversalStep>> {
        Self::check_cancelled(token)?;
        // Hop-by-hop walk mirroring the SQLite BFS (`storage/graph_queries.rs`),
        // re-expressed against the pool since rusqlite's synchronous `Connection`
        // isn't available here.
        use std::collections::HashSet;

        let mut results = Vec::new();
        let mut visited_memories: HashSet<String> = HashSet::from([start.as_str().to_string()]);
        let mut frontier_entities: Vec<String> = self
            .get_memory_entities(start, token)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();
        let mut visited_entities: HashSet<String> = frontier_entities.iter().cloned().collect();

        let mut hop = 1u32;
        while hop <= max_hops && !frontier_entities.is_empty() && results.len() < limit {
            let rels = self.relationships_touching(&frontier_entities, token).await?;
            let mut next_entities = Vec::new();
            for rel in &rels {
                for (from, to) in [
                    (rel.source_id.clone(), rel.target_id.clone()),
                    (rel.target_id.clone(), rel.source_id.clone()),
                ] {
                    if frontier_entities.contains(&from) && !visited_entities.contains(&to) {
                        visited_entities.insert(to.clone());
                        next_entities.push(to);
                    }
                }
            }

            for entity_id in &next_entities {
                let rows = sqlx::query(
                    "SELECT m.* FROM memories m
                     JOIN memory_entities me ON me.memory_id = m.id
                     WHERE me.entity_id = $1 AND m.deleted_at IS NULL",
                )
                .bind(entity_id)
                .fetch_all(&self.pool)
                .await
                .map_err(MementoError::Postgres)?;
                for row in &rows {
                    let memory = memory_from_row(row)?;
                    if visited_memories.insert(memory.id.as_str().to_string()) {
                        results.push(TraversalStep {
                            memory,
                            hop,
                            via_entity: entity_id.clone(),
                        });
                        if results.len() >= limit {
                            break;
                        }
                    }
                }
                if results.len() >= limit {
                    break;
                }
            }

            frontier_entities = next_entities;
            hop += 1;
        }

        results.truncate(limit);
        Ok(results)
    }

    async fn get_memory_entities(&self, id: &MemoryId, token: &CancellationToken) -> Result<Vec<Entity>> {
        Self::check_cancelled(token)?;
        let rows = sqlx::query(
            "SELECT e.* FROM entities e
             JOIN memory_entities me ON me.entity_id = e.id
             WHERE me.memory_id = $1",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn get_evolution_chain(&self, id: &MemoryId, token: &CancellationToken) -> Result<Vec<Memory>> {
        Self::check_cancelled(token)?;
        use std::collections::{HashSet, VecDeque};
        let mut chain = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(id.clone());
        let mut seen = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.as_str().to_string()) {
                continue;
            }
            if let Ok(memory) = self.get(&current, token).await {
                chain.push(memory);
            }
            let entity_ids: Vec<String> = self
                .get_memory_entities(&current, token)
                .await?
                .into_iter()
                .map(|e| e.id)
                .collect();
            let rels = self.relationships_touching(&entity_ids, token).await?;
            for rel in rels.iter().filter(|r| r.relationship_type == "evolved_into") {
                for target_entity in [&rel.source_id, &rel.target_id] {
                    let rows = sqlx::query(
                        "SELECT m.* FROM memories m
                         JOIN memory_entities me ON me.memory_id = m.id
                         WHERE me.entity_id = $1 AND m.deleted_at IS NULL",
                    )
                    .bind(target_entity)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(MementoError::Postgres)?;
                    for row in &rows {
                        let memory = memory_from_row(row)?;
                        if !seen.contains(memory.id.as_str()) {
                            queue.push_back(memory.id.clone());
                        }
                    }
                }
            }
        }

        chain.sort_by_key(|m| m.created_at);
        Ok(chain)
    }

    async fn get_memories_by_relation_type(
        &self,
        id: &MemoryId,
        relation_type: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Memory>> {
        Self::check_cancelled(token)?;
        use std::collections::HashSet;
        let entity_ids: Vec<String> = self
            .get_memory_entities(id, token)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();
        let rels = self.relationships_touching(&entity_ids, token).await?;

        let mut target_entities: HashSet<String> = HashSet::new();
        for rel in rels.iter().filter(|r| r.relationship_type == relation_type) {
            if entity_ids.contains(&rel.source_id) {
                target_entities.insert(rel.target_id.clone());
            }
            if rel.bidirectional && entity_ids.contains(&rel.target_id) {
                target_entities.insert(rel.source_id.clone());
            }
        }

        let mut memories = Vec::new();
        let mut seen = HashSet::new();
        for entity_id in target_entities {
            let rows = sqlx::query(
                "SELECT m.* FROM memories m
                 JOIN memory_entities me ON me.memory_id = m.id
                 WHERE me.entity_id = $1 AND m.deleted_at IS NULL",
            )
            .bind(&entity_id)
            .fetch_all(&self.pool)
            .await
            .map_err(MementoError::Postgres)?;
            for row in &rows {
                let memory = memory_from_row(row)?;
                if seen.insert(memory.id.as_str().to_string()) {
                    memories.push(memory);
                }
            }
        }
        Ok(memories)
    }

    async fn create_entity(&self, entity: Entity, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        sqlx::query(
            "INSERT INTO entities (id, name, entity_type, description, created_at)
             VALUES ($1,$2,$3,$4,$5) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&entity.id)
        .bind(&entity.name)
        .bind(&entity.entity_type)
        .bind(&entity.description)
        .bind(entity.created_at)
        .execute(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        Ok(())
    }

    async fn link_memory_entity(
        &self,
        memory_id: &MemoryId,
        entity_id: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(token)?;
        sqlx::query(
            "INSERT INTO memory_entities (memory_id, entity_id) VALUES ($1,$2)
             ON CONFLICT (memory_id, entity_id) DO NOTHING",
        )
        .bind(memory_id.as_str())
        .bind(entity_id)
        .execute(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        Ok(())
    }

    async fn get_entity(&self, entity_id: &str, token: &CancellationToken) -> Result<Entity> {
        Self::check_cancelled(token)?;
        let row = sqlx::query("SELECT * FROM entities WHERE id=$1")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(MementoError::Postgres)?
            .ok_or_else(|| MementoError::NotFound(entity_id.to_string()))?;
        entity_from_row(&row)
    }

    async fn create_relationship(&self, rel: Relationship, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        sqlx::query(
            "INSERT INTO relationships (id, source_id, target_id, relationship_type, weight, bidirectional, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&rel.id)
        .bind(&rel.source_id)
        .bind(&rel.target_id)
        .bind(&rel.relationship_type)
        .bind(rel.weight)
        .bind(rel.bidirectional)
        .bind(rel.created_at)
        .execute(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        Ok(())
    }

    async fn relationships_touching(
        &self,
        entity_ids: &[String],
        token: &CancellationToken,
    ) -> Result<Vec<Relationship>> {
        Self::check_cancelled(token)?;
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM relationships WHERE source_id = ANY($1) OR target_id = ANY($1)",
        )
        .bind(entity_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        rows.iter().map(relationship_from_row).collect()
    }

    async fn record_unknown_type(&self, type_name: &str, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        sqlx::query(
            "INSERT INTO unknown_type_stats (type_name, count, last_seen) VALUES ($1, 1, $2)
             ON CONFLICT (type_name) DO UPDATE SET count = unknown_type_stats.count + 1, last_seen = excluded.last_seen",
        )
        .bind(type_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        Ok(())
    }

    async fn unknown_type_stats(&self, token: &CancellationToken) -> Result<Vec<UnknownTypeStat>> {
        Self::check_cancelled(token)?;
        let rows = sqlx::query("SELECT type_name, count, last_seen FROM unknown_type_stats")
            .fetch_all(&self.pool)
            .await
            .map_err(MementoError::Postgres)?;
        rows.iter()
            .map(|row| {
                Ok(UnknownTypeStat {
                    type_name: row.try_get("type_name").map_err(MementoError::Postgres)?,
                    count: row.try_get("count").map_err(MementoError::Postgres)?,
                    last_seen: row.try_get("last_seen").map_err(MementoError::Postgres)?,
                })
            })
            .collect()
    }

    async fn store_embedding(&self, embedding: Embedding, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        sqlx::query(
            "INSERT INTO embeddings (memory_id, model_name, vector, created_at)
             VALUES ($1,$2,$3,$4)
             ON CONFLICT (memory_id, model_name) DO UPDATE SET vector=excluded.vector, created_at=excluded.created_at",
        )
        .bind(embedding.memory_id.as_str())
        .bind(&embedding.model_name)
        .bind(vector_to_blob(&embedding.vector))
        .bind(embedding.created_at)
        .execute(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;

        sqlx::query("UPDATE memories SET embedding_status='done', updated_at=$1 WHERE id=$2")
            .bind(Utc::now())
            .bind(embedding.memory_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(MementoError::Postgres)?;
        Ok(())
    }

    async fn get_embedding(
        &self,
        memory_id: &MemoryId,
        model_name: &str,
        token: &CancellationToken,
    ) -> Result<Option<Embedding>> {
        Self::check_cancelled(token)?;
        let row = sqlx::query(
            "SELECT vector, created_at FROM embeddings WHERE memory_id=$1 AND model_name=$2",
        )
        .bind(memory_id.as_str())
        .bind(model_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        let Some(row) = row else { return Ok(None) };
        let blob: Vec<u8> = row.try_get("vector").map_err(MementoError::Postgres)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(MementoError::Postgres)?;
        Ok(Some(Embedding::from_blob(
            memory_id.clone(),
            model_name,
            &blob,
            created_at,
        )))
    }

    async fn memories_missing_embeddings(
        &self,
        model_name: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<MemoryId>> {
        Self::check_cancelled(token)?;
        let rows = sqlx::query(
            "SELECT m.id FROM memories m
             LEFT JOIN embeddings e ON e.memory_id = m.id AND e.model_name = $1
             WHERE e.memory_id IS NULL AND m.deleted_at IS NULL
             LIMIT $2",
        )
        .bind(model_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(MementoError::Postgres)?;
                Ok(MemoryId::from(id))
            })
            .collect()
    }

    async fn save_setting(&self, key: &str, value: &str, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1,$2)
             ON CONFLICT (key) DO UPDATE SET value=excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        Ok(())
    }

    async fn load_setting(&self, key: &str, token: &CancellationToken) -> Result<Option<String>> {
        Self::check_cancelled(token)?;
        let row = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key=$1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(MementoError::Postgres)?;
        Ok(row)
    }

    async fn load_all_settings(&self, token: &CancellationToken) -> Result<UserSettings> {
        Self::check_cancelled(token)?;
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await
            .map_err(MementoError::Postgres)?;
        let mut map = HashMap::new();
        for row in &rows {
            let key: String = row.try_get("key").map_err(MementoError::Postgres)?;
            let value: String = row.try_get("value").map_err(MementoError::Postgres)?;
            map.insert(key, value);
        }
        Ok(UserSettings(map))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl SearchProvider for PostgresBackend {
    /// Ranked text search over the generated `content_tsv` column (§4.6).
    async fn full_text_search(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
        token: &CancellationToken,
    ) -> Result<Vec<Memory>> {
        Self::check_cancelled(token)?;
        let rows = sqlx::query(
            "SELECT *, ts_rank(content_tsv, websearch_to_tsquery('english', $1)) AS rank
             FROM memories
             WHERE content_tsv @@ websearch_to_tsquery('english', $1) AND deleted_at IS NULL
             ORDER BY rank DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(query)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        rows.iter().map(memory_from_row).collect()
    }
}

#[async_trait]
impl DbAccess for PostgresBackend {
    async fn activity_counts(
        &self,
        since: DateTime<Utc>,
        bucket_width_secs: i64,
        token: &CancellationToken,
    ) -> Result<Vec<(i64, i64)>> {
        Self::check_cancelled(token)?;
        let rows = sqlx::query(
            "SELECT (EXTRACT(EPOCH FROM created_at)::BIGINT / $1) * $1 AS bucket, count(*) AS n
             FROM memories
             WHERE created_at >= $2 AND deleted_at IS NULL
             GROUP BY bucket
             ORDER BY bucket",
        )
        .bind(bucket_width_secs)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        rows.iter()
            .map(|row| {
                let bucket: i64 = row.try_get("bucket").map_err(MementoError::Postgres)?;
                let n: i64 = row.try_get("n").map_err(MementoError::Postgres)?;
                Ok((bucket, n))
            })
            .collect()
    }

    async fn entity_memory_counts(
        &self,
        entity_ids: &[String],
        token: &CancellationToken,
    ) -> Result<std::collections::HashMap<String, i64>> {
        Self::check_cancelled(token)?;
        if entity_ids.is_empty() {
            return Ok(std::collections::HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT entity_id, count(*) AS n FROM memory_entities WHERE entity_id = ANY($1) GROUP BY entity_id",
        )
        .bind(entity_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        rows.iter()
            .map(|row| {
                let entity_id: String = row.try_get("entity_id").map_err(MementoError::Postgres)?;
                let n: i64 = row.try_get("n").map_err(MementoError::Postgres)?;
                Ok((entity_id, n))
            })
            .collect()
    }

    async fn search_entities(&self, query: &str, limit: usize, token: &CancellationToken) -> Result<Vec<Entity>> {
        Self::check_cancelled(token)?;
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            "SELECT * FROM entities WHERE name ILIKE $1 ESCAPE '\\' ORDER BY created_at DESC LIMIT $2",
        )
        .bind(pattern)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn search_relationships(
        &self,
        query: &str,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<Relationship>> {
        Self::check_cancelled(token)?;
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            "SELECT * FROM relationships WHERE relationship_type ILIKE $1 ESCAPE '\\' ORDER BY created_at DESC LIMIT $2",
        )
        .bind(pattern)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        rows.iter().map(relationship_from_row).collect()
    }
}

#[async_trait]
impl super::Overlay for PostgresBackend {
    async fn load_overlay(
        &self,
        connection_id: &str,
        token: &CancellationToken,
    ) -> Result<crate::types::SettingsOverlay> {
        Self::check_cancelled(token)?;
        let row = sqlx::query(
            "SELECT custom_entity_types, custom_relationship_types, custom_memory_types,
                    custom_classification_schemas, active_classification_category
             FROM settings_overlay WHERE connection_id = $1",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;

        let Some(row) = row else {
            return Ok(crate::types::SettingsOverlay {
                connection_id: connection_id.to_string(),
                ..Default::default()
            });
        };

        let entity: serde_json::Value = row.try_get("custom_entity_types").map_err(MementoError::Postgres)?;
        let relationship: serde_json::Value =
            row.try_get("custom_relationship_types").map_err(MementoError::Postgres)?;
        let memory: serde_json::Value = row.try_get("custom_memory_types").map_err(MementoError::Postgres)?;
        let schemas: serde_json::Value =
            row.try_get("custom_classification_schemas").map_err(MementoError::Postgres)?;
        let active: Option<String> =
            row.try_get("active_classification_category").map_err(MementoError::Postgres)?;

        Ok(crate::types::SettingsOverlay {
            connection_id: connection_id.to_string(),
            custom_entity_types: serde_json::from_value(entity).unwrap_or_default(),
            custom_relationship_types: serde_json::from_value(relationship).unwrap_or_default(),
            custom_memory_types: serde_json::from_value(memory).unwrap_or_default(),
            custom_classification_schemas: serde_json::from_value(schemas).unwrap_or_default(),
            active_classification_category: active,
        })
    }

    async fn save_overlay(&self, overlay: &crate::types::SettingsOverlay, token: &CancellationToken) -> Result<()> {
        Self::check_cancelled(token)?;
        sqlx::query(
            "INSERT INTO settings_overlay (
                connection_id, custom_entity_types, custom_relationship_types,
                custom_memory_types, custom_classification_schemas, active_classification_category
             ) VALUES ($1,$2,$3,$4,$5,$6)
             ON CONFLICT (connection_id) DO UPDATE SET
                custom_entity_types = excluded.custom_entity_types,
                custom_relationship_types = excluded.custom_relationship_types,
                custom_memory_types = excluded.custom_memory_types,
                custom_classification_schemas = excluded.custom_classification_schemas,
                active_classification_category = excluded.active_classification_category",
        )
        .bind(&overlay.connection_id)
        .bind(serde_json::to_value(&overlay.custom_entity_types)?)
        .bind(serde_json::to_value(&overlay.custom_relationship_types)?)
        .bind(serde_json::to_value(&overlay.custom_memory_types)?)
        .bind(serde_json::to_value(&overlay.custom_classification_schemas)?)
        .bind(&overlay.active_classification_category)
        .execute(&self.pool)
        .await
        .map_err(MementoError::Postgres)?;
        Ok(())
    }
}
