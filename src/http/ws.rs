//! `/ws` upgrade handler (§4.7, §6.2): a split-socket `ws_handler`/
//! `handle_socket` pattern reading from the bounded, per-subscriber
//! [`crate::events::EventHub`].

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde_json::json;

use super::AppState;
use crate::error::MementoError;

/// `GET /ws`: only upgrades requests whose `Origin` header (if any) is on the
/// configured allow-list; anything else is rejected before the handshake.
pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>, headers: axum::http::HeaderMap) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        return super::ApiError(MementoError::Unauthorized("origin not allowed".into())).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut rx) = state.event_hub.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = json!({ "type": event.event_type.as_str(), "memoryId": event.memory_id.as_str() });
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.event_hub.unsubscribe(id);
}
