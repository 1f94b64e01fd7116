//! Memory-level graph traversal: multi-hop `get_related_multi_hop`/
//! `get_neighborhood` queries that batch edge lookups per hop and deduplicate
//! visited nodes via a `HashMap`/`HashSet`, walking entity-relationship hops.

use std::collections::{HashSet, VecDeque};

use rusqlite::Connection;

use super::entity_queries::{entities_for_memory, relationships_touching};
use super::queries::{get_memory, memory_from_row};
use crate::error::Result;
use crate::storage::TraversalStep;
use crate::types::{Memory, MemoryId};

/// Breadth-first walk outward from a memory through its entities and
/// relationships, deduplicated, bounded by both hops and result count (§4.1 `Traverse`).
pub fn traverse(
    conn: &Connection,
    start: &MemoryId,
    max_hops: u32,
    limit: usize,
) -> Result<Vec<TraversalStep>> {
    let mut results = Vec::new();
    let mut visited_memories: HashSet<String> = HashSet::from([start.as_str().to_string()]);
    let mut frontier_entities: Vec<String> = entities_for_memory(conn, start)?
        .into_iter()
        .map(|e| e.id)
        .collect();
    let mut visited_entities: HashSet<String> = frontier_entities.iter().cloned().collect();

    let mut hop = 1u32;
    while hop <= max_hops && !frontier_entities.is_empty() && results.len() < limit {
        let rels = relationships_touching(conn, &frontier_entities)?;
        let mut next_entities = Vec::new();
        let mut reached_memories: Vec<(String, String)> = Vec::new(); // (memory_id, via_entity)

        for rel in &rels {
            for (from, to) in [
                (rel.source_id.clone(), rel.target_id.clone()),
                (rel.target_id.clone(), rel.source_id.clone()),
            ] {
                if frontier_entities.contains(&from) && !visited_entities.contains(&to) {
                    visited_entities.insert(to.clone());
                    next_entities.push(to.clone());
                }
            }
        }

        for entity_id in &next_entities {
            let mut stmt = conn.prepare(
                "SELECT m.* FROM memories m
                 JOIN memory_entities me ON me.memory_id = m.id
                 WHERE me.entity_id = ?1 AND m.deleted_at IS NULL",
            )?;
            let memories: Vec<Memory> = stmt
                .query_map([entity_id.as_str()], memory_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for memory in memories {
                if visited_memories.insert(memory.id.as_str().to_string()) {
                    reached_memories.push((memory.id.as_str().to_string(), entity_id.clone()));
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

/// The chain of memories this one evolved from/into, following a `derived_from`
/// relationship type between memories' linked entities, newest last.
pub fn evolution_chain(conn: &Connection, id: &MemoryId) -> Result<Vec<Memory>> {
    let mut chain = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(id.clone());
    let mut seen = HashSet::new();

    while let Some(current) = queue.pop_front() {
        if !seen.insert(current.as_str().to_string()) {
            continue;
        }
        if let Ok(memory) = get_memory(conn, &current) {
            chain.push(memory);
        }
        let entities = entities_for_memory(conn, &current)?;
        let entity_ids: Vec<String> = entities.into_iter().map(|e| e.id).collect();
        let rels = relationships_touching(conn, &entity_ids)?;
        for rel in rels.iter().filter(|r| r.relationship_type == "evolved_into") {
            let mut stmt = conn.prepare(
                "SELECT m.* FROM memories m
                 JOIN memory_entities me ON me.memory_id = m.id
                 WHERE me.entity_id = ?1 AND m.deleted_at IS NULL",
            )?;
            for target_entity in [&rel.source_id, &rel.target_id] {
                let memories: Vec<Memory> = stmt
                    .query_map([target_entity.as_str()], memory_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for memory in memories {
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

/// Memories reachable from `id` via relationships of exactly `relation_type` (§4.1).
pub fn memories_by_relation_type(
    conn: &Connection,
    id: &MemoryId,
    relation_type: &str,
) -> Result<Vec<Memory>> {
    let entities = entities_for_memory(conn, id)?;
    let entity_ids: Vec<String> = entities.into_iter().map(|e| e.id).collect();
    let rels = relationships_touching(conn, &entity_ids)?;

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
        let mut stmt = conn.prepare(
            "SELECT m.* FROM memories m
             JOIN memory_entities me ON me.memory_id = m.id
             WHERE me.entity_id = ?1 AND m.deleted_at IS NULL",
        )?;
        let rows: Vec<Memory> = stmt
            .query_map([entity_id.as_str()], memory_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for memory in rows {
            if seen.insert(memory.id.as_str().to_string()) {
                memories.push(memory);
            }
        }
    }
    Ok(memories)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entity_queries::{insert_entity, insert_relationship, link_memory_entity};
    use crate::storage::queries::insert_memory;
    use crate::storage::SqliteStorage;
    use crate::types::{Entity, Relationship};

    #[test]
    fn traverse_respects_hop_and_result_limits() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                // m1--E1--E2--m2, E2--E3--m3: each memory linked to exactly one entity
                // so each BFS hop discovers exactly one new memory.
                let m1 = Memory::new("default", "seed");
                let m2 = Memory::new("default", "hop1");
                let m3 = Memory::new("default", "hop2");
                let e1 = Entity::new("E1", "t");
                let e2 = Entity::new("E2", "t");
                let e3 = Entity::new("E3", "t");
                insert_entity(conn, &e1)?;
                insert_entity(conn, &e2)?;
                insert_entity(conn, &e3)?;
                link_memory_entity(conn, &m1.id, &e1.id)?;
                link_memory_entity(conn, &m2.id, &e2.id)?;
                link_memory_entity(conn, &m3.id, &e3.id)?;
                insert_memory(conn, &m1)?;
                insert_memory(conn, &m2)?;
                insert_memory(conn, &m3)?;
                insert_relationship(conn, &Relationship::new(e1.id.clone(), e2.id.clone(), "related_to"))?;
                insert_relationship(conn, &Relationship::new(e2.id.clone(), e3.id.clone(), "related_to"))?;

                let one_hop = traverse(conn, &m1.id, 1, 10)?;
                assert_eq!(one_hop.len(), 1);
                assert_eq!(one_hop[0].memory.id, m2.id);

                let two_hop = traverse(conn, &m1.id, 2, 10)?;
                let ids: HashSet<_> = two_hop.iter().map(|s| s.memory.id.as_str().to_string()).collect();
                assert!(ids.contains(m3.id.as_str()));
                assert_eq!(two_hop.len(), 2);
                Ok(())
            })
            .unwrap();
    }
}
