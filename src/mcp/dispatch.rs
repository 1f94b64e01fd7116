//! The five JSON-RPC stdio methods (§6.1): `store_memory`, `recall_memory`,
//! `find_related`, `retry_enrichment`, `explain_reasoning`. `Dispatcher`
//! is the `McpHandler` the stdio binary hands to `McpServer::run`; it owns no
//! transport concerns of its own, only routing method names to the
//! connection/engine/store plumbing already built.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::connections::ConnectionManager;
use crate::enrichment::{AgentIdentity, MemoryEngine};
use crate::error::{MementoError, Result};
use crate::mcp::protocol::{McpHandler, McpRequest, McpResponse, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::search::score::score_memory;
use crate::types::MemoryId;

pub const STORE_MEMORY: &str = "store_memory";
pub const RECALL_MEMORY: &str = "recall_memory";
pub const FIND_RELATED: &str = "find_related";
pub const RETRY_ENRICHMENT: &str = "retry_enrichment";
pub const EXPLAIN_REASONING: &str = "explain_reasoning";

/// Routes the five stdio methods to a single connection's store and engine.
/// One stdio process serves one connection at a time — unlike the HTTP
/// adapter, there's no per-request connection-selection header here (§6.1
/// names no `connection` param).
pub struct Dispatcher {
    connections: Arc<ConnectionManager>,
    connection_name: String,
    engine: Arc<MemoryEngine>,
    agent_identity: Arc<dyn AgentIdentity>,
}

impl Dispatcher {
    pub fn new(
        connections: Arc<ConnectionManager>,
        connection_name: impl Into<String>,
        engine: Arc<MemoryEngine>,
        agent_identity: Arc<dyn AgentIdentity>,
    ) -> Self {
        Self { connections, connection_name: connection_name.into(), engine, agent_identity }
    }

    async fn store_memory(&self, params: Value, token: &CancellationToken) -> Result<Value> {
        let content = params
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| MementoError::InvalidInput("store_memory requires a non-empty 'content'".into()))?;
        if content.trim().is_empty() {
            return Err(MementoError::InvalidInput("store_memory requires a non-empty 'content'".into()));
        }

        let store = self.connections.get_store(&self.connection_name).await?;
        let mut memory = crate::types::Memory::new(&self.connection_name, content);
        memory.created_by = Some(
            params
                .get("created_by")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.agent_identity.detect_agent(None)),
        );
        if let Some(tags) = params.get("tags").and_then(Value::as_array) {
            memory.tags = tags.iter().filter_map(Value::as_str).map(str::to_string).collect();
        }
        if let Some(importance) = params.get("importance").and_then(Value::as_f64) {
            memory.importance = importance as f32;
        }

        store.store(memory.clone(), token).await?;
        self.engine.notify_created(&memory.id);
        self.engine.queue_enrichment(memory.id.clone(), memory.content.clone());

        Ok(json!({
            "id": memory.id.as_str(),
            "status": "pending",
            "message": "memory stored and queued for enrichment",
        }))
    }

    async fn recall_memory(&self, params: Value, token: &CancellationToken) -> Result<Value> {
        let id_str = params
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MementoError::InvalidInput("recall_memory requires 'id'".into()))?;
        let id: MemoryId = id_str
            .parse()
            .map_err(|e: String| MementoError::InvalidInput(e))?;

        let store = self.connections.get_store(&self.connection_name).await?;
        match store.get(&id, token).await {
            Ok(memory) => {
                store.increment_access_count(&id, token).await?;
                Ok(json!({ "memory": memory, "found": true }))
            }
            Err(MementoError::NotFound(_)) => Ok(json!({ "memory": Value::Null, "found": false })),
            Err(err) => Err(err),
        }
    }

    async fn find_related(&self, params: Value, token: &CancellationToken) -> Result<Value> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| MementoError::InvalidInput("find_related requires 'query'".into()))?;
        let limit = params.get("limit").and_then(Value::as_i64).unwrap_or(20);
        let domain = params.get("domain").and_then(Value::as_str);

        let handle = self.connections.get_store_handle(&self.connection_name).await?;
        let results = crate::search::search(&handle, query, domain, limit, 0, token).await?;

        Ok(json!({ "memories": results.memories.items, "total": results.memories.total }))
    }

    async fn retry_enrichment(&self, params: Value, token: &CancellationToken) -> Result<Value> {
        let id_str = params
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MementoError::InvalidInput("retry_enrichment requires 'id'".into()))?;
        let id: MemoryId = id_str
            .parse()
            .map_err(|e: String| MementoError::InvalidInput(e))?;

        let queued = self.engine.retry_enrichment(&id, token).await?;
        Ok(json!({
            "id": id.as_str(),
            "queued": queued,
            "message": if queued { "re-queued for enrichment" } else { "queue is full; not re-queued" },
        }))
    }

    async fn explain_reasoning(&self, params: Value, token: &CancellationToken) -> Result<Value> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| MementoError::InvalidInput("explain_reasoning requires 'query'".into()))?;
        let memory_ids = params
            .get("memory_ids")
            .and_then(Value::as_array)
            .ok_or_else(|| MementoError::InvalidInput("explain_reasoning requires 'memory_ids'".into()))?;

        let store = self.connections.get_store(&self.connection_name).await?;
        let mut reasoning = Vec::new();
        for raw_id in memory_ids {
            let id_str = raw_id
                .as_str()
                .ok_or_else(|| MementoError::InvalidInput("memory_ids must be strings".into()))?;
            let id: MemoryId = id_str.parse().map_err(|e: String| MementoError::InvalidInput(e))?;
            let memory = store.get(&id, token).await?;
            let breakdown = score_memory(&memory, query);
            reasoning.push(json!({
                "id": id.as_str(),
                "score": breakdown.total,
                "text_match": breakdown.text_match,
                "importance": breakdown.importance,
                "decay": breakdown.decay,
            }));
        }

        let explanation = format!(
            "scored {} candidate memor{} against query {:?} using text-match ({:.0}%), importance ({:.0}%), and decay ({:.0}%) weighting",
            reasoning.len(),
            if reasoning.len() == 1 { "y" } else { "ies" },
            query,
            crate::search::score::TEXT_WEIGHT * 100.0,
            crate::search::score::IMPORTANCE_WEIGHT * 100.0,
            crate::search::score::DECAY_WEIGHT * 100.0,
        );

        Ok(json!({ "explanation": explanation, "reasoning": reasoning }))
    }
}

#[async_trait::async_trait]
impl McpHandler for Dispatcher {
    async fn handle_request(&self, request: McpRequest) -> McpResponse {
        let token = CancellationToken::new();
        let result = match request.method.as_str() {
            STORE_MEMORY => self.store_memory(request.params, &token).await,
            RECALL_MEMORY => self.recall_memory(request.params, &token).await,
            FIND_RELATED => self.find_related(request.params, &token).await,
            RETRY_ENRICHMENT => self.retry_enrichment(request.params, &token).await,
            EXPLAIN_REASONING => self.explain_reasoning(request.params, &token).await,
            other => {
                return McpResponse::error(
                    request.id,
                    METHOD_NOT_FOUND,
                    format!("unknown method '{other}'"),
                )
            }
        };

        match result {
            Ok(value) => McpResponse::success(request.id, value),
            Err(err @ MementoError::InvalidInput(_)) => {
                McpResponse::error(request.id, INVALID_PARAMS, err.to_string())
            }
            Err(err) => McpResponse::from_error(request.id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::{EngineConfig, HashEmbedder, NaiveExtractor};
    use crate::storage::SqliteBackend;
    use crate::types::Connection as ConnectionCfg;
    use crate::types::{DatabaseConfig, DatabaseKind};

    async fn dispatcher() -> (Dispatcher, Arc<ConnectionManager>) {
        let dir = std::env::temp_dir().join(format!("memento-mcp-test-{}", crate::types::generate_id()));
        std::fs::create_dir_all(&dir).unwrap();
        let registry_path = dir.join("connections.json");
        let connections = Arc::new(ConnectionManager::open(&registry_path).unwrap());
        let db_path = dir.join("default.db").to_string_lossy().to_string();
        connections
            .add_connection(ConnectionCfg::new(
                "default",
                DatabaseConfig { kind: DatabaseKind::EmbeddedFile, path: Some(db_path), dsn: None },
            ))
            .unwrap();
        connections.set_default_connection("default").unwrap();

        let store = connections.get_store("default").await.unwrap();
        let engine = Arc::new(MemoryEngine::new(
            store,
            Arc::new(NaiveExtractor),
            Arc::new(HashEmbedder::new("test-model", 8)),
            None,
            None,
            EngineConfig::default(),
        ));
        engine.start(CancellationToken::new());

        (
            Dispatcher::new(connections.clone(), "default", engine, Arc::new(crate::enrichment::DefaultAgentIdentity)),
            connections,
        )
    }

    #[tokio::test]
    async fn store_then_recall_round_trips() {
        let (dispatcher, _connections) = dispatcher().await;
        let token = CancellationToken::new();

        let stored = dispatcher
            .store_memory(json!({"content": "remember this"}), &token)
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();
        assert_eq!(stored["status"], "pending");

        let recalled = dispatcher.recall_memory(json!({"id": id}), &token).await.unwrap();
        assert_eq!(recalled["found"], true);
        assert_eq!(recalled["memory"]["content"], "remember this");
    }

    #[tokio::test]
    async fn recall_of_missing_id_reports_not_found_without_error() {
        let (dispatcher, _connections) = dispatcher().await;
        let token = CancellationToken::new();
        let recalled = dispatcher
            .recall_memory(json!({"id": "mem:default:doesnotexist"}), &token)
            .await
            .unwrap();
        assert_eq!(recalled["found"], false);
    }

    #[tokio::test]
    async fn store_memory_without_content_is_invalid_params() {
        let (dispatcher, _connections) = dispatcher().await;
        let token = CancellationToken::new();
        let err = dispatcher.store_memory(json!({}), &token).await.unwrap_err();
        assert!(matches!(err, MementoError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unknown_method_maps_to_method_not_found_code() {
        let (dispatcher, _connections) = dispatcher().await;
        let response = dispatcher
            .handle_request(McpRequest {
                jsonrpc: "2.0".to_string(),
                id: Some(Value::from(1)),
                method: "nonexistent_method".to_string(),
                params: Value::Null,
            })
            .await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn explain_reasoning_scores_each_requested_memory() {
        let (dispatcher, _connections) = dispatcher().await;
        let token = CancellationToken::new();
        let stored = dispatcher
            .store_memory(json!({"content": "Rust is a systems language"}), &token)
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        let explained = dispatcher
            .explain_reasoning(json!({"query": "Rust", "memory_ids": [id]}), &token)
            .await
            .unwrap();
        assert_eq!(explained["reasoning"].as_array().unwrap().len(), 1);
        assert!(explained["reasoning"][0]["score"].as_f64().unwrap() > 0.0);
    }
}
