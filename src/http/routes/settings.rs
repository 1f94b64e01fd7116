//! `/api/connections/{id}/settings` taxonomy overlay (§4.4, §6.2).

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use crate::http::{ApiError, ApiResult, AppState};
use crate::types::SettingsOverlay;

/// Returns the raw overlay plus the merged view a client would render.
pub async fn get_settings(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    let overlay = state.connections.get_overlay(&name).await?;
    let merged = state.connections.get_merged_taxonomy(&name).await?;
    Ok(Json(json!({ "overlay": overlay, "merged": merged })))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut overlay): Json<SettingsOverlay>,
) -> ApiResult<Json<serde_json::Value>> {
    overlay.connection_id = name.clone();
    state.connections.save_overlay(&name, &overlay).await.map_err(ApiError)?;
    let merged = state.connections.get_merged_taxonomy(&name).await?;
    Ok(Json(json!({ "overlay": overlay, "merged": merged })))
}
