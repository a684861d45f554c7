//! WebSocket sessions for live reminder delivery.
//!
//! Protocol:
//! → Client connects: GET /ws?owner_id=42
//! ← Server sends: {"type":"connected","session_id":"...","group":"user_42","version":"..."}
//! → Client sends: {"type":"ping"}
//! ← Server sends: {"type":"pong"}
//! ← Server pushes: {"type":"notification","payload":{...}}

use std::sync::Arc;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use chime_core::types::OwnerId;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use super::fanout::group_name;
use super::server::AppState;

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    pub owner_id: OwnerId,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SessionParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params.owner_id, state))
}

/// Pump hub frames out and answer client messages until either side goes away.
async fn handle_socket(socket: WebSocket, owner_id: OwnerId, state: Arc<AppState>) {
    let (session_id, mut outbound) = state.hub.register(owner_id);
    let (mut sink, mut stream) = socket.split();

    let welcome = serde_json::json!({
        "type": "connected",
        "session_id": session_id.to_string(),
        "group": group_name(owner_id),
        "version": env!("CARGO_PKG_VERSION"),
    });
    if send_json(&mut sink, &welcome).await.is_ok() {
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = reply_to(text.as_str()) {
                            if send_json(&mut sink, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WS receive error on session {session_id}: {e}");
                        break;
                    }
                },
            }
        }
    }

    state.hub.unregister(owner_id, session_id);
}

/// Response to a client frame, if any.
fn reply_to(text: &str) -> Option<serde_json::Value> {
    let json = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(j) => j,
        Err(e) => {
            return Some(serde_json::json!({
                "type": "error",
                "message": format!("Invalid JSON: {e}"),
            }));
        }
    };
    match json["type"].as_str().unwrap_or("unknown") {
        "ping" => Some(serde_json::json!({"type": "pong"})),
        other => Some(serde_json::json!({
            "type": "error",
            "message": format!("Unknown message type: {other}"),
        })),
    }
}

async fn send_json<S>(sink: &mut S, value: &serde_json::Value) -> Result<(), ()>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    sink.send(Message::Text(value.to_string().into()))
        .await
        .map_err(|e| {
            tracing::debug!("WS send failed: {e}");
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_pong() {
        assert_eq!(reply_to(r#"{"type":"ping"}"#), Some(serde_json::json!({"type": "pong"})));
    }

    #[test]
    fn test_bad_frames_get_errors() {
        let reply = reply_to("not json").unwrap();
        assert_eq!(reply["type"], "error");
        let reply = reply_to(r#"{"type":"chat"}"#).unwrap();
        assert_eq!(reply["message"], "Unknown message type: chat");
    }
}
