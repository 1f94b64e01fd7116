//! Shared SQL row-mapping and statement helpers for the SQLite backend:
//! a `memory_from_row` idiom generalized to this crate's memory row shape.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{MementoError, Result};
use crate::types::*;

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

/// Map one `memories` row to a [`Memory`].
pub fn memory_from_row(row: &Row) -> rusqlite::Result<Memory> {
    let id: String = row.get("id")?;
    let tags_json: String = row.get("tags")?;
    let metadata_json: String = row.get("metadata")?;
    let status_str: String = row.get("status")?;
    let entity_status_str: String = row.get("entity_status")?;
    let relationship_status_str: String = row.get("relationship_status")?;
    let embedding_status_str: String = row.get("embedding_status")?;
    let timestamp: String = row.get("timestamp")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let enriched_at: Option<String> = row.get("enriched_at")?;
    let deleted_at: Option<String> = row.get("deleted_at")?;

    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let metadata: HashMap<String, serde_json::Value> =
        serde_json::from_str(&metadata_json).unwrap_or_default();

    Ok(Memory {
        id: MemoryId::from(id),
        content: row.get("content")?,
        source: row.get("source")?,
        tags,
        metadata,
        timestamp: parse_ts(&timestamp),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        created_by: row.get("created_by")?,
        importance: row.get("importance")?,
        access_count: row.get("access_count")?,
        decay_score: row.get("decay_score")?,
        status: status_str.parse().unwrap_or_default(),
        entity_status: entity_status_str.parse().unwrap_or_default(),
        relationship_status: relationship_status_str.parse().unwrap_or_default(),
        embedding_status: embedding_status_str.parse().unwrap_or_default(),
        enrichment_attempts: row.get("enrichment_attempts")?,
        enrichment_error: row.get("enrichment_error")?,
        enriched_at: parse_opt_ts(enriched_at),
        deleted_at: parse_opt_ts(deleted_at),
    })
}

pub fn insert_memory(conn: &Connection, m: &Memory) -> Result<()> {
    let tags_json = serde_json::to_string(&m.tags)?;
    let metadata_json = serde_json::to_string(&m.metadata)?;
    conn.execute(
        "INSERT INTO memories (
            id, content, source, tags, metadata, timestamp, created_at, updated_at,
            created_by, importance, access_count, decay_score, status,
            entity_status, relationship_status, embedding_status,
            enrichment_attempts, enrichment_error, enriched_at, deleted_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
        params![
            m.id.as_str(),
            m.content,
            m.source,
            tags_json,
            metadata_json,
            m.timestamp.to_rfc3339(),
            m.created_at.to_rfc3339(),
            m.updated_at.to_rfc3339(),
            m.created_by,
            m.importance,
            m.access_count,
            m.decay_score,
            m.status.as_str(),
            m.entity_status.as_str(),
            m.relationship_status.as_str(),
            m.embedding_status.as_str(),
            m.enrichment_attempts,
            m.enrichment_error,
            m.enriched_at.map(|t| t.to_rfc3339()),
            m.deleted_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn get_memory(conn: &Connection, id: &MemoryId) -> Result<Memory> {
    conn.query_row(
        "SELECT * FROM memories WHERE id = ?1 AND deleted_at IS NULL",
        params![id.as_str()],
        memory_from_row,
    )
    .optional()?
    .ok_or_else(|| MementoError::NotFound(id.to_string()))
}

pub fn apply_memory_edit(conn: &Connection, id: &MemoryId, edit: &MemoryEdit) -> Result<Memory> {
    let mut current = get_memory(conn, id)?;
    if let Some(content) = &edit.content {
        current.content = content.clone();
    }
    if let Some(source) = &edit.source {
        current.source = Some(source.clone());
    }
    if let Some(tags) = &edit.tags {
        current.tags = tags.clone();
    }
    if let Some(metadata) = &edit.metadata {
        current.metadata = metadata.clone();
    }
    if let Some(importance) = edit.importance {
        current.importance = importance;
    }
    current.updated_at = Utc::now();

    let tags_json = serde_json::to_string(&current.tags)?;
    let metadata_json = serde_json::to_string(&current.metadata)?;
    conn.execute(
        "UPDATE memories SET content=?1, source=?2, tags=?3, metadata=?4, importance=?5, updated_at=?6
         WHERE id=?7",
        params![
            current.content,
            current.source,
            tags_json,
            metadata_json,
            current.importance,
            current.updated_at.to_rfc3339(),
            id.as_str(),
        ],
    )?;
    Ok(current)
}

pub fn update_status(conn: &Connection, id: &MemoryId, status: MemoryStatus) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE memories SET status=?1, updated_at=?2 WHERE id=?3",
        params![status.as_str(), now, id.as_str()],
    )?;
    if changed == 0 {
        return Err(MementoError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Apply only the `Some` fields of an [`EnrichmentPatch`] (§4.1 `UpdateEnrichment`).
pub fn apply_enrichment_patch(
    conn: &Connection,
    id: &MemoryId,
    patch: &EnrichmentPatch,
) -> Result<()> {
    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(v) = patch.entity_status {
        sets.push("entity_status=?".to_string());
        values.push(Box::new(v.as_str()));
    }
    if let Some(v) = patch.relationship_status {
        sets.push("relationship_status=?".to_string());
        values.push(Box::new(v.as_str()));
    }
    if let Some(v) = patch.embedding_status {
        sets.push("embedding_status=?".to_string());
        values.push(Box::new(v.as_str()));
    }
    if let Some(v) = patch.status {
        sets.push("status=?".to_string());
        values.push(Box::new(v.as_str()));
    }
    if let Some(v) = patch.enrichment_attempts {
        sets.push("enrichment_attempts=?".to_string());
        values.push(Box::new(v));
    }
    if let Some(v) = &patch.enrichment_error {
        sets.push("enrichment_error=?".to_string());
        values.push(Box::new(v.clone()));
    }
    if let Some(v) = &patch.enriched_at {
        sets.push("enriched_at=?".to_string());
        values.push(Box::new(v.map(|t| t.to_rfc3339())));
    }

    if sets.is_empty() {
        return Ok(());
    }

    sets.push("updated_at=?".to_string());
    values.push(Box::new(Utc::now().to_rfc3339()));

    let sql = format!(
        "UPDATE memories SET {} WHERE id=?",
        sets.join(", ")
    );
    values.push(Box::new(id.as_str().to_string()));

    let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
    let changed = conn.execute(&sql, param_refs.as_slice())?;
    if changed == 0 {
        return Err(MementoError::NotFound(id.to_string()));
    }
    Ok(())
}

pub fn increment_access_count(conn: &Connection, id: &MemoryId) -> Result<()> {
    let changed = conn.execute(
        "UPDATE memories SET access_count = access_count + 1 WHERE id=?1",
        params![id.as_str()],
    )?;
    if changed == 0 {
        return Err(MementoError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Recompute `decay_score` for every memory as an exponential function of age in days.
pub fn update_decay_scores(conn: &Connection) -> Result<i64> {
    let now = Utc::now();
    let mut stmt = conn.prepare("SELECT id, created_at FROM memories WHERE deleted_at IS NULL")?;
    let rows: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let mut updated = 0i64;
    for (id, created_at) in rows {
        let created = parse_ts(&created_at);
        let age_days = (now - created).num_seconds() as f64 / 86_400.0;
        let decay = (-age_days / 30.0).exp().max(0.0) as f32;
        conn.execute(
            "UPDATE memories SET decay_score=?1 WHERE id=?2",
            params![decay, id],
        )?;
        updated += 1;
    }
    Ok(updated)
}

pub fn soft_delete(conn: &Connection, id: &MemoryId) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE memories SET deleted_at=?1 WHERE id=?2 AND deleted_at IS NULL",
        params![now, id.as_str()],
    )?;
    if changed == 0 {
        return Err(MementoError::NotFound(id.to_string()));
    }
    Ok(())
}

pub fn restore(conn: &Connection, id: &MemoryId) -> Result<()> {
    let changed = conn.execute(
        "UPDATE memories SET deleted_at=NULL WHERE id=?1",
        params![id.as_str()],
    )?;
    if changed == 0 {
        return Err(MementoError::NotFound(id.to_string()));
    }
    Ok(())
}

pub fn purge(conn: &Connection, id: &MemoryId) -> Result<()> {
    let changed = conn.execute("DELETE FROM memories WHERE id=?1", params![id.as_str()])?;
    if changed == 0 {
        return Err(MementoError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Build and run the `List` query (§4.1), returning items plus the total count
/// matching the filter (ignoring pagination).
pub fn list_memories(conn: &Connection, opts: &ListOptions) -> Result<(Vec<Memory>, i64)> {
    let mut clauses = vec!["deleted_at IS NULL".to_string()];
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(domain) = &opts.domain {
        clauses.push("id LIKE ?".to_string());
        args.push(Box::new(format!("mem:{domain}:%")));
    }
    if let Some(status) = opts.status {
        clauses.push("status = ?".to_string());
        args.push(Box::new(status.as_str().to_string()));
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

    let count_sql = format!("SELECT count(*) FROM memories WHERE {where_clause}");
    let total: i64 = {
        let param_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        conn.query_row(&count_sql, param_refs.as_slice(), |row| row.get(0))?
    };

    let limit = opts.clamped_limit();
    let list_sql = format!(
        "SELECT * FROM memories WHERE {where_clause} ORDER BY {sort_col} {direction} LIMIT ? OFFSET ?"
    );
    args.push(Box::new(limit));
    args.push(Box::new(opts.offset.max(0)));

    let param_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&list_sql)?;
    let items: Vec<Memory> = stmt
        .query_map(param_refs.as_slice(), memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if let Some(wanted_tags) = &opts.tags {
        let filtered: Vec<Memory> = items
            .into_iter()
            .filter(|m| wanted_tags.iter().all(|t| m.tags.contains(t)))
            .collect();
        return Ok((filtered, total));
    }

    Ok((items, total))
}

/// Fetch the embedding row for (memory_id, model_name), if present.
pub fn get_embedding(
    conn: &Connection,
    memory_id: &MemoryId,
    model_name: &str,
) -> Result<Option<Embedding>> {
    conn.query_row(
        "SELECT vector, created_at FROM embeddings WHERE memory_id=?1 AND model_name=?2",
        params![memory_id.as_str(), model_name],
        |row| {
            let blob: Vec<u8> = row.get(0)?;
            let created_at: String = row.get(1)?;
            Ok((blob, created_at))
        },
    )
    .optional()?
    .map(|(blob, created_at)| {
        Ok(Embedding::from_blob(
            memory_id.clone(),
            model_name,
            &blob,
            parse_ts(&created_at),
        ))
    })
    .transpose()
}

pub fn upsert_embedding(conn: &Connection, embedding: &Embedding) -> Result<()> {
    conn.execute(
        "INSERT INTO embeddings (memory_id, model_name, vector, created_at)
         VALUES (?1,?2,?3,?4)
         ON CONFLICT(memory_id, model_name) DO UPDATE SET vector=excluded.vector, created_at=excluded.created_at",
        params![
            embedding.memory_id.as_str(),
            embedding.model_name,
            embedding.to_blob(),
            embedding.created_at.to_rfc3339(),
        ],
    )?;
    // mark embedding stage done as a side effect of a successful write, matching
    // the narrow-write invariant the engine relies on (§4.5).
    conn.execute(
        "UPDATE memories SET embedding_status='done', updated_at=?1 WHERE id=?2",
        params![Utc::now().to_rfc3339(), embedding.memory_id.as_str()],
    )?;
    Ok(())
}

pub fn memories_missing_embeddings(
    conn: &Connection,
    model_name: &str,
    limit: usize,
) -> Result<Vec<MemoryId>> {
    let mut stmt = conn.prepare(
        "SELECT m.id FROM memories m
         LEFT JOIN embeddings e ON e.memory_id = m.id AND e.model_name = ?1
         WHERE e.memory_id IS NULL AND m.deleted_at IS NULL
         LIMIT ?2",
    )?;
    let ids: Vec<MemoryId> = stmt
        .query_map(params![model_name, limit as i64], |row| {
            let id: String = row.get(0)?;
            Ok(MemoryId::from(id))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

pub fn save_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1,?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn load_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM settings WHERE key=?1", params![key], |row| {
            row.get(0)
        })
        .optional()?)
}

pub fn load_all_settings(conn: &Connection) -> Result<UserSettings> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
    let map: HashMap<String, String> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    Ok(UserSettings(map))
}

pub fn record_unknown_type(conn: &Connection, type_name: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO unknown_type_stats (type_name, count, last_seen) VALUES (?1, 1, ?2)
         ON CONFLICT(type_name) DO UPDATE SET count = count + 1, last_seen = excluded.last_seen",
        params![type_name, now],
    )?;
    Ok(())
}

pub fn unknown_type_stats(conn: &Connection) -> Result<Vec<UnknownTypeStat>> {
    let mut stmt = conn.prepare("SELECT type_name, count, last_seen FROM unknown_type_stats")?;
    let stats: Vec<UnknownTypeStat> = stmt
        .query_map([], |row| {
            let type_name: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let last_seen: String = row.get(2)?;
            Ok((type_name, count, last_seen))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .map(|(type_name, count, last_seen)| UnknownTypeStat {
            type_name,
            count,
            last_seen: parse_ts(&last_seen),
        })
        .collect();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    fn setup() -> SqliteStorage {
        SqliteStorage::open_in_memory().unwrap()
    }

    #[test]
    fn store_then_get_round_trips() {
        let storage = setup();
        let m = Memory::new("default", "hello world");
        let id = m.id.clone();
        storage.with_connection(|conn| insert_memory(conn, &m)).unwrap();
        let fetched = storage.with_connection(|conn| get_memory(conn, &id)).unwrap();
        assert_eq!(fetched.content, "hello world");
        assert_eq!(fetched.status, MemoryStatus::Pending);
    }

    #[test]
    fn get_missing_memory_is_not_found() {
        let storage = setup();
        let id = MemoryId::from_parts("default", "missing");
        let result = storage.with_connection(|conn| get_memory(conn, &id));
        assert!(matches!(result, Err(MementoError::NotFound(_))));
    }

    #[test]
    fn enrichment_patch_only_touches_named_fields() {
        let storage = setup();
        let m = Memory::new("default", "hello world");
        let id = m.id.clone();
        let original_content = m.content.clone();
        storage.with_connection(|conn| insert_memory(conn, &m)).unwrap();

        let patch = EnrichmentPatch {
            entity_status: Some(StageStatus::Done),
            ..Default::default()
        };
        storage
            .with_connection(|conn| apply_enrichment_patch(conn, &id, &patch))
            .unwrap();

        let fetched = storage.with_connection(|conn| get_memory(conn, &id)).unwrap();
        assert_eq!(fetched.entity_status, StageStatus::Done);
        assert_eq!(fetched.relationship_status, StageStatus::Pending);
        assert_eq!(fetched.content, original_content);
    }

    #[test]
    fn soft_delete_then_restore() {
        let storage = setup();
        let m = Memory::new("default", "hello world");
        let id = m.id.clone();
        storage.with_connection(|conn| insert_memory(conn, &m)).unwrap();
        storage.with_connection(|conn| soft_delete(conn, &id)).unwrap();
        assert!(storage.with_connection(|conn| get_memory(conn, &id)).is_err());
        storage.with_connection(|conn| restore(conn, &id)).unwrap();
        assert!(storage.with_connection(|conn| get_memory(conn, &id)).is_ok());
    }

    #[test]
    fn list_clamps_limit_and_filters_by_status() {
        let storage = setup();
        for i in 0..3 {
            let mut m = Memory::new("default", format!("memory {i}"));
            if i == 0 {
                m.status = MemoryStatus::Enriched;
            }
            storage.with_connection(|conn| insert_memory(conn, &m)).unwrap();
        }
        let opts = ListOptions {
            status: Some(MemoryStatus::Enriched),
            ..Default::default()
        };
        let (items, total) = storage.with_connection(|conn| list_memories(conn, &opts)).unwrap();
        assert_eq!(total, 1);
        assert_eq!(items.len(), 1);
    }
}
