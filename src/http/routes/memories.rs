//! CRUD + retry on `/api/memories[/{id}]` (§6.2).

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::http::routes::resolve_connection;
use crate::http::{ApiError, ApiResult, AppState};
use crate::types::{ListOptions, Memory, MemoryEdit, MemoryId, MemoryStatus, SortDirection, SortKey};

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    connection: Option<String>,
    domain: Option<String>,
    status: Option<String>,
    tags: Option<String>,
    sort: Option<String>,
    direction: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

pub async fn list(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<ListQuery>) -> ApiResult<Json<Value>> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let store = state.connections.get_store(&name).await?;

    let opts = ListOptions {
        domain: q.domain,
        status: q.status.as_deref().and_then(|s| s.parse::<MemoryStatus>().ok()),
        tags: q.tags.map(|t| t.split(',').map(str::to_string).collect()),
        sort_key: match q.sort.as_deref() {
            Some("updated_at") => SortKey::UpdatedAt,
            Some("importance") => SortKey::Importance,
            Some("decay_score") => SortKey::DecayScore,
            _ => SortKey::CreatedAt,
        },
        sort_direction: match q.direction.as_deref() {
            Some("asc") => SortDirection::Asc,
            _ => SortDirection::Desc,
        },
        limit: q.limit.unwrap_or(0),
        offset: q.offset.unwrap_or(0),
    };

    let page = store.list(&opts, &CancellationToken::new()).await?;
    Ok(Json(json!(page)))
}

#[derive(Debug, Deserialize)]
pub struct CreateMemory {
    content: String,
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    importance: Option<f32>,
    #[serde(default)]
    created_by: Option<String>,
}

/// POST `/api/memories` (§6.2): 201 with a Pending memory, then enqueues
/// enrichment exactly as the stdio `store_memory` method does.
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateMemory>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.content.trim().is_empty() {
        return Err(ApiError(crate::error::MementoError::InvalidInput(
            "content must not be empty".into(),
        )));
    }
    let name = resolve_connection(None, &headers, body.connection_id.as_deref());
    let resolved_name = state.resolve_name(&name)?;
    let store = state.connections.get_store(&name).await?;
    let engine = state.get_engine(&name).await?;

    let domain = body.domain.as_deref().unwrap_or(&resolved_name);
    let mut memory = Memory::new(domain, body.content);
    memory.source = body.source;
    memory.tags = body.tags;
    memory.created_by = Some(body.created_by.unwrap_or_else(|| "unknown".to_string()));
    if let Some(importance) = body.importance {
        memory.importance = importance;
    }

    store.store(memory.clone(), &CancellationToken::new()).await?;
    engine.notify_created(&memory.id);
    engine.queue_enrichment(memory.id.clone(), memory.content.clone());

    Ok((StatusCode::CREATED, Json(json!(memory))))
}

fn parse_id(id_str: &str) -> ApiResult<MemoryId> {
    id_str.parse().map_err(|e: String| ApiError(crate::error::MementoError::InvalidInput(e)))
}

#[derive(Debug, Deserialize, Default)]
pub struct ConnectionQuery {
    connection: Option<String>,
}

pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<ConnectionQuery>,
) -> ApiResult<Json<Value>> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let store = state.connections.get_store(&name).await?;
    let id = parse_id(&id)?;
    let memory = store.get(&id, &CancellationToken::new()).await?;
    Ok(Json(json!(memory)))
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<ConnectionQuery>,
    Json(edit): Json<MemoryEdit>,
) -> ApiResult<Json<Value>> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let store = state.connections.get_store(&name).await?;
    let id = parse_id(&id)?;
    let memory = store.update(&id, edit, &CancellationToken::new()).await?;
    Ok(Json(json!(memory)))
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<ConnectionQuery>,
) -> ApiResult<StatusCode> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let store = state.connections.get_store(&name).await?;
    let id = parse_id(&id)?;
    store.delete(&id, &CancellationToken::new()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/api/memories/{id}/retry` (§4.5, §6.2, scenario S3): 200
/// `{queued: true}` when the memory was `Failed`; a non-`Failed` memory is a
/// 409 `Conflict` with `{queued: false}` surfaced in the error body.
pub async fn retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<ConnectionQuery>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let engine = state.get_engine(&name).await?;
    let id = parse_id(&id)?;
    let token = CancellationToken::new();
    match engine.retry_enrichment(&id, &token).await {
        Ok(queued) => Ok((StatusCode::OK, Json(json!({ "queued": queued })))),
        Err(err @ crate::error::MementoError::Conflict(_)) => {
            Ok((StatusCode::CONFLICT, Json(json!({ "queued": false, "error": err.to_string() }))))
        }
        Err(err) => Err(ApiError(err)),
    }
}
