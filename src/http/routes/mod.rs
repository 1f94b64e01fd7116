//! Per-path-shape handlers for the `/api/*` routes (§6.2).

pub mod connections;
pub mod memories;
pub mod search;
pub mod settings;
pub mod stats;

use axum::http::HeaderMap;

/// Connection selection precedence for a request (§6.2 implementation note,
/// generalizing §4.3 `GetStore`'s name-or-default resolution to the HTTP
/// surface): query param, then `X-Connection` header, then the registry
/// default. `body_field` is only consulted by handlers that accept a JSON
/// body naming a connection explicitly (memory creation).
pub fn resolve_connection(query: Option<&str>, headers: &HeaderMap, body_field: Option<&str>) -> String {
    if let Some(q) = query {
        if !q.is_empty() {
            return q.to_string();
        }
    }
    if let Some(h) = headers.get("x-connection-id").and_then(|v| v.to_str().ok()) {
        if !h.is_empty() {
            return h.to_string();
        }
    }
    if let Some(b) = body_field {
        if !b.is_empty() {
            return b.to_string();
        }
    }
    String::new()
}
