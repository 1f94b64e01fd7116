//! `/api/connections*` CRUD + test + default, and per-connection maintenance
//! (status, backfill, unknown-types) (§4.3, §6.2).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::MementoError;
use crate::http::{ApiError, ApiResult, AppState};
use crate::types::{Connection, DatabaseConfig, ListOptions, MemoryStatus};

pub async fn list(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "connections": state.connections.list_connections() }))
}

pub async fn get_one(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    let conn = state
        .connections
        .list_connections()
        .into_iter()
        .find(|c| c.name == name)
        .ok_or_else(|| ApiError(MementoError::NotFound(format!("connection '{name}'"))))?;
    Ok(Json(json!(conn)))
}

#[derive(Debug, Deserialize)]
pub struct CreateConnection {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    database: DatabaseConfig,
}

pub async fn create(State(state): State<AppState>, Json(body): Json<CreateConnection>) -> ApiResult<(StatusCode, Json<Value>)> {
    let mut conn = Connection::new(&body.name, body.database);
    if let Some(display_name) = body.display_name {
        conn.display_name = display_name;
    }
    state.connections.add_connection(conn.clone())?;
    Ok((StatusCode::CREATED, Json(json!(conn))))
}

pub async fn update(State(state): State<AppState>, Path(name): Path<String>, Json(updated): Json<Connection>) -> ApiResult<Json<Value>> {
    state.connections.update_connection(&name, updated.clone()).await?;
    Ok(Json(json!(updated)))
}

pub async fn delete(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.connections.delete_connection(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SetDefault {
    name: String,
}

pub async fn set_default(State(state): State<AppState>, Json(body): Json<SetDefault>) -> ApiResult<Json<Value>> {
    state.connections.set_default_connection(&body.name)?;
    Ok(Json(json!({ "default": body.name })))
}

#[derive(Debug, Deserialize)]
pub struct TestConnection {
    database: DatabaseConfig,
}

pub async fn test(State(state): State<AppState>, Json(body): Json<TestConnection>) -> ApiResult<Json<Value>> {
    state.connections.test_connection(&body.database).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn maintenance_status(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    let engine = state.get_engine(&name).await?;
    Ok(Json(json!({ "queue_size": engine.queue_size() })))
}

#[derive(Debug, Deserialize)]
pub struct Backfill {
    #[serde(rename = "type")]
    kind: String,
}

/// `POST /api/connections/{name}/maintenance/backfill` (§6.2): bulk re-admits
/// memories missing embeddings or stuck outside `Enriched`, up to a fixed
/// batch size per call so one request can't monopolize the queue.
const BACKFILL_BATCH: usize = 500;

pub async fn maintenance_backfill(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Backfill>,
) -> ApiResult<Json<Value>> {
    let store = state.connections.get_store(&name).await?;
    let engine = state.get_engine(&name).await?;
    let token = CancellationToken::new();
    let mut queued = 0usize;

    match body.kind.as_str() {
        "embeddings" | "re-embed-all" => {
            let model = "nomic-embed-text";
            let ids = store.memories_missing_embeddings(model, BACKFILL_BATCH, &token).await?;
            for id in ids {
                let memory = store.get(&id, &token).await?;
                if engine.queue_embedding(id, memory.content) {
                    queued += 1;
                }
            }
        }
        "enrichment" => {
            for status in [MemoryStatus::Pending, MemoryStatus::Failed] {
                let opts = ListOptions { status: Some(status), limit: BACKFILL_BATCH as i64, ..Default::default() };
                let page = store.list(&opts, &token).await?;
                for memory in page.items {
                    if engine.queue_enrichment(memory.id, memory.content) {
                        queued += 1;
                    }
                }
            }
        }
        other => {
            return Err(ApiError(MementoError::InvalidInput(format!(
                "unknown backfill type '{other}'"
            ))))
        }
    }

    Ok(Json(json!({ "queued": queued })))
}

pub async fn unknown_types(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    let store = state.connections.get_store(&name).await?;
    let stats = store.unknown_type_stats(&CancellationToken::new()).await?;
    Ok(Json(json!({ "unknown_types": stats })))
}
