//! WebSocket notification stream: one full-duplex channel per user,
//! bridged from the notification bus's live broadcast.
//!
//! A lagging socket drops live events; the durable store remains the
//! source of truth and is queryable over the REST listing.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws/notifications", get(ws_notifications))
}

#[derive(Deserialize)]
pub struct WsQuery {
    pub user_id: String,
}

async fn ws_notifications(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.notifier.subscribe(&user_id);
    tracing::debug!(user = user_id.as_str(), "ws subscriber connected");

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(payload) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    // The store still has everything this socket missed.
                    tracing::debug!(missed, "ws subscriber lagged; dropping live events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
    tracing::debug!(user = user_id.as_str(), "ws subscriber disconnected");
}
