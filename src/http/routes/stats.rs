//! `/api/stats`, `/api/activity`, `/api/queue` (§4.6).

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::http::routes::resolve_connection;
use crate::http::{ApiError, ApiResult, AppState};
use crate::search::graph::activity_buckets;
use crate::types::{ListOptions, MemoryStatus};

#[derive(Debug, Deserialize, Default)]
pub struct ConnectionQuery {
    connection: Option<String>,
}

/// Memory counts broken down by lifecycle status, plus the live queue size.
pub async fn stats(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<ConnectionQuery>) -> ApiResult<Json<Value>> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let store = state.connections.get_store(&name).await?;
    let token = CancellationToken::new();

    let mut by_status = serde_json::Map::new();
    let mut total = 0i64;
    for status in [
        MemoryStatus::Pending,
        MemoryStatus::Processing,
        MemoryStatus::Enriched,
        MemoryStatus::Failed,
        MemoryStatus::Archived,
    ] {
        let opts = ListOptions { status: Some(status), limit: 1, ..Default::default() };
        let page = store.list(&opts, &token).await?;
        total += page.total;
        by_status.insert(status.as_str().to_string(), json!(page.total));
    }

    let queue_size = state.get_engine(&name).await.map(|e| e.queue_size()).unwrap_or(0);

    Ok(Json(json!({ "total": total, "by_status": by_status, "queue_size": queue_size })))
}

/// Dense, zero-filled activity series over fixed windows (§4.6). Requires a
/// `DbAccess`-capable backend; a backend without one reports empty series
/// rather than failing the whole request.
pub async fn activity(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<ConnectionQuery>) -> ApiResult<Json<Value>> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let handle = state.connections.get_store_handle(&name).await?;
    let token = CancellationToken::new();

    let series = match &handle.db {
        Some(db) => activity_buckets(db, chrono::Utc::now(), &token).await.map_err(ApiError)?,
        None => Vec::new(),
    };
    Ok(Json(json!({ "series": series })))
}

/// Advisory in-flight + buffered enrichment job count for one connection.
pub async fn queue(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<ConnectionQuery>) -> ApiResult<Json<Value>> {
    let name = resolve_connection(q.connection.as_deref(), &headers, None);
    let engine = state.get_engine(&name).await?;
    Ok(Json(json!({ "queue_size": engine.queue_size() })))
}
