//! HTTP/JSON + WebSocket front end (C7, §4.7, §6.2). Assembles a
//! state-carrying `axum::Router` with a `/ws` upgrade route alongside the
//! plain JSON routes, covering the full `/api/*` surface of §6.2 plus a
//! connection-scoped WebSocket stream.

pub mod routes;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, SecurityMode};
use crate::connections::ConnectionManager;
use crate::enrichment::{EngineConfig, HashEmbedder, MemoryEngine, NaiveExtractor};
use crate::error::MementoError;
use crate::events::EventHub;

/// Shared state handed to every handler. One [`MemoryEngine`] is constructed
/// per connection name, lazily, the first time a request needs to write to
/// that connection — mirroring [`ConnectionManager`]'s own lazy store
/// construction.
#[derive(Clone)]
pub struct AppState {
    pub connections: Arc<ConnectionManager>,
    pub config: Arc<Config>,
    pub event_hub: EventHub,
    engines: Arc<RwLock<HashMap<String, Arc<MemoryEngine>>>>,
    cancel: CancellationToken,
}

impl AppState {
    pub fn new(connections: Arc<ConnectionManager>, config: Arc<Config>, event_hub: EventHub, cancel: CancellationToken) -> Self {
        Self { connections, config, event_hub, engines: Arc::new(RwLock::new(HashMap::new())), cancel }
    }

    /// Resolve a connection name the way every other per-connection operation
    /// does: empty string means "the registry's default connection".
    pub fn resolve_name(&self, name: &str) -> crate::error::Result<String> {
        if name.is_empty() {
            Ok(self.connections.get_default_connection()?.name)
        } else {
            Ok(name.to_string())
        }
    }

    /// Get or lazily build the enrichment engine for one connection (§4.5,
    /// §5). Worker count is forced to 1 for an embedded-file store paired
    /// with a local LLM provider, matching the stdio front end's own rule,
    /// since both front ends may be enriching the same on-disk file.
    pub async fn get_engine(&self, name: &str) -> crate::error::Result<Arc<MemoryEngine>> {
        let name = self.resolve_name(name)?;
        if let Some(engine) = self.engines.read().get(&name).cloned() {
            return Ok(engine);
        }

        let conn = self
            .connections
            .list_connections()
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| MementoError::NotFound(format!("connection '{name}'")))?;
        let handle = self.connections.get_store_handle(&name).await?;
        let taxonomy = self.connections.get_merged_taxonomy(&name).await?;

        let num_workers = if matches!(conn.database.kind, crate::types::DatabaseKind::EmbeddedFile)
            && conn.llm.provider.is_local()
        {
            1
        } else {
            self.config.num_workers
        };

        let engine_config = EngineConfig {
            num_workers,
            embedding_model: conn.llm.embedding_model.clone(),
            valid_entity_types: taxonomy.all_entity_types.into_iter().map(|t| t.id).collect(),
            valid_relationship_types: taxonomy.all_relationship_types.into_iter().map(|t| t.id).collect(),
            ..EngineConfig::default()
        };

        let engine = Arc::new(MemoryEngine::new(
            handle.store,
            Arc::new(NaiveExtractor),
            Arc::new(HashEmbedder::new(conn.llm.embedding_model.clone(), 256)),
            Some(self.event_hub.clone()),
            None,
            engine_config,
        ));
        engine.start(self.cancel.clone());

        self.engines.write().insert(name, engine.clone());
        Ok(engine)
    }
}

/// Render any [`MementoError`] as `{error: {code, message}}` with the
/// matching HTTP status (§7).
pub struct ApiError(pub MementoError);

impl From<MementoError> for ApiError {
    fn from(err: MementoError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.redacted(),
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

/// Bearer-token check for `security_mode = production` (§6.5, §7
/// Unauthorized). `/api/health` is exempt; every other `/api/*` route needs
/// `Authorization: Bearer <token>` to match `config.api_token` in constant time.
async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.config.security_mode != SecurityMode::Production {
        return next.run(request).await;
    }
    if request.uri().path() == "/api/health" {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if state.config.token_matches(token) => next.run(request).await,
        _ => ApiError(MementoError::Unauthorized("missing or invalid bearer token".into())).into_response(),
    }
}

/// Assemble the full router (§6.2). Route handlers live in `routes/*`; this
/// function only wires paths to them and layers CORS/tracing/auth around the
/// whole `/api` tree, plus `/ws` and `/health` on a bare `Router::new()`.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/memories", get(routes::memories::list).post(routes::memories::create))
        .route(
            "/memories/:id",
            get(routes::memories::get_one).patch(routes::memories::update).delete(routes::memories::delete),
        )
        .route("/memories/:id/retry", post(routes::memories::retry))
        .route("/stats", get(routes::stats::stats))
        .route("/activity", get(routes::stats::activity))
        .route("/queue", get(routes::stats::queue))
        .route("/search", get(routes::search::search))
        .route("/entities", get(routes::search::list_entities))
        .route("/entities/:id/graph", get(routes::search::entity_graph))
        .route("/relationships", get(routes::search::list_relationships))
        .route("/connections", get(routes::connections::list).post(routes::connections::create))
        .route("/connections/default", patch(routes::connections::set_default))
        .route(
            "/connections/:name",
            get(routes::connections::get_one).patch(routes::connections::update).delete(routes::connections::delete),
        )
        .route("/connections/:name/test", post(routes::connections::test))
        .route("/connections/:name/maintenance/status", get(routes::connections::maintenance_status))
        .route("/connections/:name/maintenance/backfill", post(routes::connections::maintenance_backfill))
        .route("/connections/:name/maintenance/unknown-types", get(routes::connections::unknown_types))
        .route(
            "/connections/:name/settings",
            get(routes::settings::get_settings).patch(routes::settings::update_settings),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/ws", get(ws::upgrade))
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
