//! Entity-neighborhood graph and activity-bucket views (§4.6): the
//! entity-level BFS here follows `storage::graph_queries::traverse`'s
//! frontier/visited/dedup-by-id shape, one level up — that function walks
//! memories reached through entities, this one walks entities reached
//! through relationships.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::storage::{DbAccess, Store};
use crate::types::{Entity, Relationship};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMeta {
    pub center_id: String,
    pub depth: u32,
    pub node_count: usize,
    pub edge_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityGraph {
    pub nodes: Vec<Entity>,
    pub edges: Vec<Relationship>,
    pub meta: GraphMeta,
}

/// `GetEntityGraph(center_id, depth)` (§4.6). `depth` is clamped to `1..=3`.
/// Node details (including `memory_count`) are only populated when `db` is
/// `Some` — a `SearchProvider`-less, `DbAccess`-less backend still returns
/// topology, just without counts.
pub async fn entity_graph(
    store: &Arc<dyn Store>,
    db: Option<&Arc<dyn DbAccess>>,
    center_id: &str,
    depth: u32,
    token: &CancellationToken,
) -> Result<EntityGraph> {
    let depth = depth.clamp(1, 3);
    let mut visited: HashSet<String> = HashSet::from([center_id.to_string()]);
    let mut frontier: Vec<String> = vec![center_id.to_string()];
    let mut edges: HashMap<String, Relationship> = HashMap::new();

    for _ in 0..depth {
        if frontier.is_empty() {
            break;
        }
        let rels = store.relationships_touching(&frontier, token).await?;
        let mut next = Vec::new();
        for rel in rels {
            for endpoint in [rel.source_id.clone(), rel.target_id.clone()] {
                if visited.insert(endpoint.clone()) {
                    next.push(endpoint);
                }
            }
            edges.entry(rel.id.clone()).or_insert(rel);
        }
        frontier = next;
    }

    let memory_counts = match db {
        Some(db) => {
            let ids: Vec<String> = visited.iter().cloned().collect();
            db.entity_memory_counts(&ids, token).await.unwrap_or_default()
        }
        None => HashMap::new(),
    };

    let mut nodes = Vec::with_capacity(visited.len());
    for id in &visited {
        if let Ok(mut entity) = store.get_entity(id, token).await {
            entity.memory_count = memory_counts.get(id).copied();
            nodes.push(entity);
        }
    }

    let edge_list: Vec<Relationship> = edges.into_values().collect();
    let meta = GraphMeta {
        center_id: center_id.to_string(),
        depth,
        node_count: nodes.len(),
        edge_count: edge_list.len(),
    };
    Ok(EntityGraph { nodes, edges: edge_list, meta })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityBucket {
    pub bucket_start: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySeries {
    pub label: &'static str,
    pub buckets: Vec<ActivityBucket>,
}

const WINDOWS: [(&str, i64); 4] = [
    ("5min", 5 * 60),
    ("1hr", 60 * 60),
    ("24hr", 24 * 60 * 60),
    ("7day", 7 * 24 * 60 * 60),
];

/// Four dense, zero-filled activity series over fixed windows, each bucketed
/// into roughly 30 points (§4.6). Requires `DbAccess`.
pub async fn activity_buckets(
    db: &Arc<dyn DbAccess>,
    now: DateTime<Utc>,
    token: &CancellationToken,
) -> Result<Vec<ActivitySeries>> {
    let mut series = Vec::with_capacity(WINDOWS.len());
    for (label, span_secs) in WINDOWS {
        let since = now - Duration::seconds(span_secs);
        let bucket_width = (span_secs / 30).max(1);
        let raw = db.activity_counts(since, bucket_width, token).await?;
        let counts: HashMap<i64, i64> = raw.into_iter().collect();

        let start_bucket = (since.timestamp() / bucket_width) * bucket_width;
        let now_epoch = now.timestamp();
        let mut buckets = Vec::new();
        let mut bucket_start = start_bucket;
        while bucket_start <= now_epoch {
            buckets.push(ActivityBucket {
                bucket_start,
                count: *counts.get(&bucket_start).unwrap_or(&0),
            });
            bucket_start += bucket_width;
        }
        series.push(ActivitySeries { label, buckets });
    }
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteBackend;
    use crate::types::{Entity, Memory, Relationship};

    #[tokio::test]
    async fn entity_graph_expands_one_hop_and_dedups_edges() {
        let store: Arc<dyn Store> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let token = CancellationToken::new();
        let e1 = Entity::new("Go", "language");
        let e2 = Entity::new("Google", "organization");
        store.create_entity(e1.clone(), &token).await.unwrap();
        store.create_entity(e2.clone(), &token).await.unwrap();
        let rel = Relationship::new(e1.id.clone(), e2.id.clone(), "created_by");
        store.create_relationship(rel, &token).await.unwrap();

        let graph = entity_graph(&store, None, &e1.id, 1, &token).await.unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.meta.center_id, e1.id);
    }

    #[tokio::test]
    async fn activity_buckets_are_dense_and_zero_filled() {
        let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let token = CancellationToken::new();
        backend.store(Memory::new("default", "hello"), &token).await.unwrap();

        let db: Arc<dyn DbAccess> = backend;
        let series = activity_buckets(&db, Utc::now(), &token).await.unwrap();
        assert_eq!(series.len(), 4);
        for s in &series {
            assert!(!s.buckets.is_empty());
        }
        let total: i64 = series[0].buckets.iter().map(|b| b.count).sum();
        assert_eq!(total, 1);
    }
}
