//! Entity and relationship CRUD: row-mapping helpers for the taxonomy-typed
//! entity/relationship shape.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{MementoError, Result};
use crate::types::{Entity, MemoryId, Relationship};

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn entity_from_row(row: &Row) -> rusqlite::Result<Entity> {
    let created_at: String = row.get("created_at")?;
    Ok(Entity {
        id: row.get("id")?,
        name: row.get("name")?,
        entity_type: row.get("entity_type")?,
        description: row.get("description")?,
        created_at: parse_ts(&created_at),
        memory_count: None,
    })
}

fn relationship_from_row(row: &Row) -> rusqlite::Result<Relationship> {
    let created_at: String = row.get("created_at")?;
    let bidirectional: i64 = row.get("bidirectional")?;
    Ok(Relationship {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        relationship_type: row.get("relationship_type")?,
        weight: row.get("weight")?,
        bidirectional: bidirectional != 0,
        created_at: parse_ts(&created_at),
    })
}

pub fn insert_entity(conn: &Connection, entity: &Entity) -> Result<()> {
    conn.execute(
        "INSERT INTO entities (id, name, entity_type, description, created_at)
         VALUES (?1,?2,?3,?4,?5)
         ON CONFLICT(id) DO NOTHING",
        params![
            entity.id,
            entity.name,
            entity.entity_type,
            entity.description,
            entity.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_entity(conn: &Connection, entity_id: &str) -> Result<Entity> {
    conn.query_row(
        "SELECT * FROM entities WHERE id=?1",
        params![entity_id],
        entity_from_row,
    )
    .optional()?
    .ok_or_else(|| MementoError::NotFound(entity_id.to_string()))
}

pub fn link_memory_entity(conn: &Connection, memory_id: &MemoryId, entity_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_entities (memory_id, entity_id) VALUES (?1,?2)
         ON CONFLICT(memory_id, entity_id) DO NOTHING",
        params![memory_id.as_str(), entity_id],
    )?;
    Ok(())
}

pub fn entities_for_memory(conn: &Connection, memory_id: &MemoryId) -> Result<Vec<Entity>> {
    let mut stmt = conn.prepare(
        "SELECT e.* FROM entities e
         JOIN memory_entities me ON me.entity_id = e.id
         WHERE me.memory_id = ?1",
    )?;
    let entities: Vec<Entity> = stmt
        .query_map(params![memory_id.as_str()], entity_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entities)
}

/// Memory count for one entity, used to populate `Entity.memory_count` in graph reads.
pub fn entity_memory_count(conn: &Connection, entity_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT count(*) FROM memory_entities WHERE entity_id=?1",
        params![entity_id],
        |row| row.get(0),
    )?)
}

/// Memories sharing at least one entity with `memory_id`, paired with the shared
/// entity names (§4.1 `GetRelatedMemories`).
pub fn related_memory_ids(
    conn: &Connection,
    memory_id: &MemoryId,
) -> Result<Vec<(MemoryId, Vec<String>)>> {
    let mut stmt = conn.prepare(
        "SELECT me2.memory_id, e.name
         FROM memory_entities me1
         JOIN memory_entities me2 ON me2.entity_id = me1.entity_id AND me2.memory_id != me1.memory_id
         JOIN entities e ON e.id = me1.entity_id
         WHERE me1.memory_id = ?1",
    )?;
    let rows: Vec<(String, String)> = stmt
        .query_map(params![memory_id.as_str()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut grouped: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    for (other_id, entity_name) in rows {
        grouped.entry(other_id).or_default().push(entity_name);
    }
    Ok(grouped
        .into_iter()
        .map(|(id, names)| (MemoryId::from(id), names))
        .collect())
}

pub fn insert_relationship(conn: &Connection, rel: &Relationship) -> Result<()> {
    conn.execute(
        "INSERT INTO relationships (id, source_id, target_id, relationship_type, weight, bidirectional, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7)
         ON CONFLICT(id) DO NOTHING",
        params![
            rel.id,
            rel.source_id,
            rel.target_id,
            rel.relationship_type,
            rel.weight,
            rel.bidirectional as i64,
            rel.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Entities whose name contains `query`, case-insensitively (§4.6 supplemental
/// search matches).
pub fn search_entities(conn: &Connection, query: &str, limit: usize) -> Result<Vec<Entity>> {
    let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
    let mut stmt = conn.prepare(
        "SELECT * FROM entities WHERE name LIKE ?1 ESCAPE '\\' COLLATE NOCASE ORDER BY created_at DESC LIMIT ?2",
    )?;
    let entities: Vec<Entity> = stmt
        .query_map(params![pattern, limit as i64], entity_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entities)
}

/// Relationships whose type contains `query`, case-insensitively (§4.6
/// supplemental search matches).
pub fn search_relationships(conn: &Connection, query: &str, limit: usize) -> Result<Vec<Relationship>> {
    let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
    let mut stmt = conn.prepare(
        "SELECT * FROM relationships WHERE relationship_type LIKE ?1 ESCAPE '\\' COLLATE NOCASE ORDER BY created_at DESC LIMIT ?2",
    )?;
    let rels: Vec<Relationship> = stmt
        .query_map(params![pattern, limit as i64], relationship_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rels)
}

/// Relationships with either endpoint in `entity_ids`, for one BFS hop (§4.6).
/// The id list is bound twice (once for `source_id IN (..)`, once for `target_id IN (..)`)
/// since rusqlite positional params don't support reusing a bound group.
pub fn relationships_touching(conn: &Connection, entity_ids: &[String]) -> Result<Vec<Relationship>> {
    if entity_ids.is_empty() {
        return Ok(Vec::new());
    }
    let n = entity_ids.len();
    let source_placeholders: Vec<String> = (1..=n).map(|i| format!("?{i}")).collect();
    let target_placeholders: Vec<String> = (n + 1..=n * 2).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT * FROM relationships WHERE source_id IN ({}) OR target_id IN ({})",
        source_placeholders.join(","),
        target_placeholders.join(","),
    );

    let mut bound: Vec<&str> = entity_ids.iter().map(|s| s.as_str()).collect();
    bound.extend(entity_ids.iter().map(|s| s.as_str()));

    let mut stmt = conn.prepare(&sql)?;
    let params_dyn: Vec<&dyn rusqlite::ToSql> =
        bound.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    let rels: Vec<Relationship> = stmt
        .query_map(params_dyn.as_slice(), relationship_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    #[test]
    fn entity_round_trips() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let entity = Entity::new("Go", "language");
        storage.with_connection(|conn| insert_entity(conn, &entity)).unwrap();
        let fetched = storage
            .with_connection(|conn| get_entity(conn, &entity.id))
            .unwrap();
        assert_eq!(fetched.name, "Go");
    }

    #[test]
    fn related_memories_share_entity() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let entity = Entity::new("Go", "language");
        storage.with_connection(|conn| insert_entity(conn, &entity)).unwrap();

        let a = MemoryId::from_parts("default", "a");
        let b = MemoryId::from_parts("default", "b");
        storage
            .with_connection(|conn| link_memory_entity(conn, &a, &entity.id))
            .unwrap();
        storage
            .with_connection(|conn| link_memory_entity(conn, &b, &entity.id))
            .unwrap();

        let related = storage
            .with_connection(|conn| related_memory_ids(conn, &a))
            .unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].0, b);
        assert_eq!(related[0].1, vec!["Go".to_string()]);
    }

    #[test]
    fn relationships_touching_finds_both_endpoints() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let e1 = Entity::new("E1", "t");
        let e2 = Entity::new("E2", "t");
        storage.with_connection(|conn| insert_entity(conn, &e1)).unwrap();
        storage.with_connection(|conn| insert_entity(conn, &e2)).unwrap();
        let rel = Relationship::new(e1.id.clone(), e2.id.clone(), "related_to");
        storage.with_connection(|conn| insert_relationship(conn, &rel)).unwrap();

        let touching = storage
            .with_connection(|conn| relationships_touching(conn, &[e1.id.clone()]))
            .unwrap();
        assert_eq!(touching.len(), 1);
        assert_eq!(touching[0].id, rel.id);
    }
}
