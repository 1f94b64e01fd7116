//! Search & Graph (C6, §4.6): a unified text-search dispatcher over memories,
//! entities, and relationships, plus the entity-neighborhood graph and
//! activity-bucket views in `graph.rs`.

pub mod graph;
pub mod score;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::connections::StoreHandle;
use crate::error::Result;
use crate::types::{Entity, ListOptions, Memory, Page, Relationship};

/// Implementation-defined page-size bounds (§4.6: "clamped, e.g. 1-100").
pub const MIN_PAGE_SIZE: i64 = 1;
pub const MAX_PAGE_SIZE: i64 = 100;

/// The unified search result shape: memories drive pagination; entities and
/// relationships are supplemental matches appended alongside (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub memories: Page<Memory>,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 {
        20
    } else {
        limit.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

/// Search memories, entities, and relationships from one query string (§4.6).
/// Memory matching prefers the backend's own `SearchProvider` ranking; absent
/// one, falls back to a case-insensitive substring match over content and
/// source. Entity/relationship matches only appear when the backend also
/// implements `DbAccess` — they're best-effort extras, not required for the
/// memory page's correctness.
pub async fn search(
    handle: &StoreHandle,
    query: &str,
    domain: Option<&str>,
    limit: i64,
    offset: i64,
    token: &CancellationToken,
) -> Result<SearchResults> {
    let limit = clamp_limit(limit);
    let offset = offset.max(0);

    let memories = match &handle.search {
        Some(provider) => {
            let items = provider.full_text_search(query, limit as usize, offset as usize, token).await?;
            let has_more = items.len() as i64 == limit;
            Page { total: items.len() as i64 + offset, limit, has_more, items }
        }
        None => substring_search(&handle.store, query, domain, limit, offset, token).await?,
    };

    let (entities, relationships) = match &handle.db {
        Some(db) => {
            let entities = db.search_entities(query, limit as usize, token).await.unwrap_or_default();
            let relationships = db.search_relationships(query, limit as usize, token).await.unwrap_or_default();
            (entities, relationships)
        }
        None => (Vec::new(), Vec::new()),
    };

    Ok(SearchResults { memories, entities, relationships })
}

/// Case-insensitive substring match over `content`/`source`, paginated after
/// the fact since `Store::list` has no text predicate of its own.
async fn substring_search(
    store: &Arc<dyn crate::storage::Store>,
    query: &str,
    domain: Option<&str>,
    limit: i64,
    offset: i64,
    token: &CancellationToken,
) -> Result<Page<Memory>> {
    let needle = query.to_lowercase();
    let opts = ListOptions { domain: domain.map(str::to_string), limit: 1000, ..Default::default() };
    let page = store.list(&opts, token).await?;

    let matched: Vec<Memory> = page
        .items
        .into_iter()
        .filter(|m| {
            needle.is_empty()
                || m.content.to_lowercase().contains(&needle)
                || m.source.as_deref().map(|s| s.to_lowercase().contains(&needle)).unwrap_or(false)
        })
        .collect();

    let total = matched.len() as i64;
    let items: Vec<Memory> = matched.into_iter().skip(offset as usize).take(limit as usize).collect();
    let has_more = offset + items.len() as i64 < total;
    Ok(Page { items, total, limit, has_more })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteBackend;
    use crate::types::Memory;

    fn handle() -> StoreHandle {
        let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
        StoreHandle { store: backend.clone(), search: None, db: Some(backend.clone()), overlay: Some(backend) }
    }

    #[tokio::test]
    async fn substring_fallback_finds_content_matches() {
        let handle = handle();
        let token = CancellationToken::new();
        handle.store.store(Memory::new("default", "Go is a compiled language"), &token).await.unwrap();
        handle.store.store(Memory::new("default", "unrelated"), &token).await.unwrap();

        let results = search(&handle, "compiled", Some("default"), 20, 0, &token).await.unwrap();
        assert_eq!(results.memories.items.len(), 1);
        assert_eq!(results.memories.total, 1);
    }

    #[tokio::test]
    async fn page_size_is_clamped() {
        assert_eq!(clamp_limit(0), 20);
        assert_eq!(clamp_limit(-5), 20);
        assert_eq!(clamp_limit(10_000), MAX_PAGE_SIZE);
        assert_eq!(clamp_limit(1), 1);
    }

    #[tokio::test]
    async fn entity_matches_are_supplemental_to_memory_pagination() {
        let handle = handle();
        let token = CancellationToken::new();
        let entity = Entity::new("Golang", "language");
        handle.store.create_entity(entity, &token).await.unwrap();

        let results = search(&handle, "Golang", None, 20, 0, &token).await.unwrap();
        assert_eq!(results.memories.total, 0);
        assert_eq!(results.entities.len(), 1);
    }
}
