//! `/api/search`, `/api/entities[/{id}/graph]`, `/api/relationships` (§4.6).

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::http::routes::resolve_connection;
use crate::http::{ApiError, ApiResult, AppState};
use crate::search::graph::entity_graph as compute_entity_graph;

#[derive(Debug, Deserialize, Default)]
pub struct SearchQuery {
    connection: Option<String>,
    q: Option<String>,
    domain: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

pub async fn search(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<SearchQuery>) -> ApiResult<Json<Value>> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let handle = state.connections.get_store_handle(&name).await?;
    let token = CancellationToken::new();
    let results = crate::search::search(
        &handle,
        q.q.as_deref().unwrap_or(""),
        q.domain.as_deref(),
        q.limit.unwrap_or(20),
        q.offset.unwrap_or(0),
        &token,
    )
    .await?;
    Ok(Json(json!(results)))
}

#[derive(Debug, Deserialize, Default)]
pub struct EntityListQuery {
    connection: Option<String>,
    q: Option<String>,
    limit: Option<i64>,
}

pub async fn list_entities(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<EntityListQuery>) -> ApiResult<Json<Value>> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let handle = state.connections.get_store_handle(&name).await?;
    let token = CancellationToken::new();
    let entities = match &handle.db {
        Some(db) => db.search_entities(q.q.as_deref().unwrap_or(""), q.limit.unwrap_or(50) as usize, &token).await?,
        None => Vec::new(),
    };
    Ok(Json(json!({ "entities": entities })))
}

pub async fn list_relationships(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<EntityListQuery>,
) -> ApiResult<Json<Value>> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let handle = state.connections.get_store_handle(&name).await?;
    let token = CancellationToken::new();
    let relationships = match &handle.db {
        Some(db) => {
            db.search_relationships(q.q.as_deref().unwrap_or(""), q.limit.unwrap_or(50) as usize, &token).await?
        }
        None => Vec::new(),
    };
    Ok(Json(json!({ "relationships": relationships })))
}

#[derive(Debug, Deserialize, Default)]
pub struct GraphQuery {
    connection: Option<String>,
    depth: Option<u32>,
}

/// `GET /api/entities/{id}/graph?depth=N` (§4.6, scenario S6).
pub async fn entity_graph(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<GraphQuery>,
) -> ApiResult<Json<Value>> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let handle = state.connections.get_store_handle(&name).await?;
    let token = CancellationToken::new();
    let graph = compute_entity_graph(&handle.store, handle.db.as_ref(), &id, q.depth.unwrap_or(2), &token)
        .await
        .map_err(ApiError)?;
    Ok(Json(json!(graph)))
}
