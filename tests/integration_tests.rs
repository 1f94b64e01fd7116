//! Scenario tests (§8): cross-module behavior that unit tests in each module
//! can't see on their own — full create-to-enrich flow, cross-process event
//! fan-out, and connection isolation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use memento::connections::ConnectionManager;
use memento::enrichment::{EngineConfig, HashEmbedder, MemoryEngine, NaiveExtractor};
use memento::error::MementoError;
use memento::events::dropdir::{watch, DropDirWriter};
use memento::mcp::protocol::{McpRequest, PARSE_ERROR};
use memento::storage::{SqliteBackend, Store};
use memento::types::{
    generate_id, Connection, DatabaseConfig, DatabaseKind, Entity, Memory, MemoryStatus, Relationship, StageStatus,
};

fn tmp_path(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("memento-it-{label}-{}", generate_id()))
}

async fn wait_until<F: Fn() -> bool>(pred: F, attempts: usize) -> bool {
    for _ in 0..attempts {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pred()
}

/// S1: a stored memory reaches `Enriched` with entities and an embedding row
/// present, and the queued-then-running transition is observable.
#[tokio::test]
async fn s1_store_then_enrich_reaches_enriched_with_embedding() {
    let store: Arc<dyn Store> = Arc::new(SqliteBackend::open_in_memory().unwrap());
    let token = CancellationToken::new();
    let memory = Memory::new("default", "Rust and Go are languages built at Google");
    store.store(memory.clone(), &token).await.unwrap();
    assert_eq!(memory.status, MemoryStatus::Pending);

    let config = EngineConfig { num_workers: 2, valid_entity_types: vec!["concept".into()], ..Default::default() };
    let engine = Arc::new(MemoryEngine::new(
        store.clone(),
        Arc::new(NaiveExtractor),
        Arc::new(HashEmbedder::new("test-model", 32)),
        None,
        None,
        config,
    ));
    engine.start(token.clone());
    assert!(engine.queue_enrichment(memory.id.clone(), memory.content.clone()));

    let reached = wait_until(
        || {
            futures::executor::block_on(store.get(&memory.id, &token))
                .map(|m| m.status == MemoryStatus::Enriched)
                .unwrap_or(false)
        },
        100,
    )
    .await;
    assert!(reached, "memory did not reach Enriched in time");

    let fetched = store.get(&memory.id, &token).await.unwrap();
    assert_eq!(fetched.entity_status, StageStatus::Done);
    assert_eq!(fetched.embedding_status, StageStatus::Done);
    assert!(fetched.enriched_at.is_some());

    let embedding = store.get_embedding(&memory.id, "test-model", &token).await.unwrap();
    assert!(embedding.is_some());
    assert_eq!(embedding.unwrap().vector.len(), 32);

    let entities = store.get_memory_entities(&memory.id, &token).await.unwrap();
    assert!(entities.iter().any(|e| e.name == "Rust" || e.name == "Go" || e.name == "Google"));

    engine.shutdown(Duration::from_secs(1)).await;
}

/// S2: a line that fails to parse as a JSON-RPC request gets exactly one
/// `-32700` response and never reaches the handler, mirroring the branch
/// `McpServer::run` takes on a `serde_json::from_str` failure.
#[test]
fn s2_malformed_json_line_yields_parse_error() {
    let malformed = "{not valid json at all";
    let parsed = serde_json::from_str::<McpRequest>(malformed);
    assert!(parsed.is_err());

    let response = memento::mcp::protocol::McpResponse::error(None, PARSE_ERROR, "parse error: ...");
    assert_eq!(response.error.unwrap().code, -32700);
    assert!(response.id.is_none());
}

/// S3: retrying a `Failed` memory re-admits it; retrying an already-`Enriched`
/// memory is refused as a `Conflict` rather than silently re-queued.
#[tokio::test]
async fn s3_retry_only_accepts_failed_memories() {
    let store: Arc<dyn Store> = Arc::new(SqliteBackend::open_in_memory().unwrap());
    let token = CancellationToken::new();
    let memory = Memory::new("default", "will fail then retry");
    store.store(memory.clone(), &token).await.unwrap();

    store.update_status(&memory.id, MemoryStatus::Failed, &token).await.unwrap();

    let config = EngineConfig { num_workers: 1, valid_entity_types: vec!["concept".into()], ..Default::default() };
    let engine = Arc::new(MemoryEngine::new(
        store.clone(),
        Arc::new(NaiveExtractor),
        Arc::new(HashEmbedder::new("test-model", 8)),
        None,
        None,
        config,
    ));

    let queued = engine.retry_enrichment(&memory.id, &token).await.unwrap();
    assert!(queued);

    let after_retry = store.get(&memory.id, &token).await.unwrap();
    assert_eq!(after_retry.status, MemoryStatus::Pending);

    // Force it straight to Enriched, as if a worker had just finished it.
    store.update_status(&memory.id, MemoryStatus::Enriched, &token).await.unwrap();

    let second = engine.retry_enrichment(&memory.id, &token).await;
    assert!(matches!(second, Err(MementoError::Conflict(_))));
}

/// S4: events written by one "process" (a `DropDirWriter`) are observed, in
/// order, by another "process" (a `watch()` reader), and no `.event` files
/// are left behind once delivered.
#[tokio::test]
async fn s4_dropdir_fanout_delivers_events_in_order() {
    let dir = tmp_path("dropdir-fanout");
    let writer = DropDirWriter::new(&dir).unwrap();

    let memory_id = memento::types::MemoryId::from_parts("default", "s4mem");
    let events = [
        memento::events::memory_created(memory_id.clone()),
        memento::events::enrichment_started(memory_id.clone()),
        memento::events::enrichment_complete(memory_id.clone()),
    ];
    for event in &events {
        writer.write(event);
        // Drop-filenames are time-ordered; a tiny gap keeps them strictly increasing
        // even on filesystems with coarse mtime resolution.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _watcher = watch(&dir, tx).unwrap();

    let mut received = Vec::new();
    for _ in 0..events.len() {
        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for dropdir event")
            .expect("channel closed early");
        received.push(payload.event_type);
    }

    assert_eq!(
        received,
        vec![
            memento::types::EventType::MemoryCreated,
            memento::types::EventType::EnrichmentStarted,
            memento::types::EventType::EnrichmentComplete,
        ]
    );

    let leftover: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|ext| ext == "event").unwrap_or(false))
        .collect();
    assert!(leftover.is_empty());

    std::fs::remove_dir_all(&dir).ok();
}

/// S5: two connections backed by distinct SQLite files stay isolated — a
/// memory stored in one never shows up in the other's listing — and both
/// database files land on disk under their own paths.
#[tokio::test]
async fn s5_two_connections_stay_isolated() {
    let dir = tmp_path("two-connections");
    std::fs::create_dir_all(&dir).unwrap();
    let registry_path = dir.join("connections.json");
    let manager = ConnectionManager::open(&registry_path).unwrap();

    let path_a = dir.join("a.db").to_string_lossy().to_string();
    let path_b = dir.join("b.db").to_string_lossy().to_string();
    manager
        .add_connection(Connection::new(
            "alpha",
            DatabaseConfig { kind: DatabaseKind::EmbeddedFile, path: Some(path_a.clone()), dsn: None },
        ))
        .unwrap();
    manager
        .add_connection(Connection::new(
            "beta",
            DatabaseConfig { kind: DatabaseKind::EmbeddedFile, path: Some(path_b.clone()), dsn: None },
        ))
        .unwrap();
    manager.set_default_connection("alpha").unwrap();

    let token = CancellationToken::new();
    let store_a = manager.get_store("alpha").await.unwrap();
    let store_b = manager.get_store("beta").await.unwrap();

    store_a.store(Memory::new("alpha", "only in alpha"), &token).await.unwrap();

    let page_a = store_a.list(&Default::default(), &token).await.unwrap();
    let page_b = store_b.list(&Default::default(), &token).await.unwrap();
    assert_eq!(page_a.items.len(), 1);
    assert_eq!(page_b.items.len(), 0);

    assert!(std::path::Path::new(&path_a).exists());
    assert!(std::path::Path::new(&path_b).exists());

    std::fs::remove_dir_all(&dir).ok();
}

/// S6: a 5-entity linear relationship chain (e1-e2-e3-e4-e5), each entity
/// linked to its own memory, traversed from the memory anchored at e1 with
/// `max_hops = 2` reaches exactly the 3-node/2-edge BFS bound: the seed's
/// direct neighbor at hop 1 and the next neighbor at hop 2, no further.
#[tokio::test]
async fn s6_entity_graph_depth_two_is_bounded_to_two_hops() {
    let store = SqliteBackend::open_in_memory().unwrap();
    let store: Arc<dyn Store> = Arc::new(store);
    let token = CancellationToken::new();

    let memories: Vec<Memory> = (0..5).map(|i| Memory::new("default", format!("node {i}"))).collect();
    let entities: Vec<Entity> = (0..5).map(|i| Entity::new(format!("E{i}"), "concept")).collect();

    for (memory, entity) in memories.iter().zip(entities.iter()) {
        store.store(memory.clone(), &token).await.unwrap();
        store.create_entity(entity.clone(), &token).await.unwrap();
        store.link_memory_entity(&memory.id, &entity.id, &token).await.unwrap();
    }
    for pair in entities.windows(2) {
        store
            .create_relationship(Relationship::new(pair[0].id.clone(), pair[1].id.clone(), "related_to"), &token)
            .await
            .unwrap();
    }

    let steps = store.traverse(&memories[0].id, 2, 100, &token).await.unwrap();
    assert_eq!(steps.len(), 2, "depth=2 must stop at exactly the 3-node/2-edge bound (seed + 2 hops)");

    let reached: std::collections::HashSet<_> = steps.iter().map(|s| s.memory.id.as_str().to_string()).collect();
    assert!(reached.contains(memories[1].id.as_str()));
    assert!(reached.contains(memories[2].id.as_str()));
    assert!(!reached.contains(memories[3].id.as_str()));

    let hop1 = steps.iter().find(|s| s.memory.id == memories[1].id).unwrap();
    let hop2 = steps.iter().find(|s| s.memory.id == memories[2].id).unwrap();
    assert_eq!(hop1.hop, 1);
    assert_eq!(hop2.hop, 2);
}
