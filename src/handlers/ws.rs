//! WebSocket handler: handshake auth (signed token with user-id fallback),
//! gateway attach/detach, ping/pong keepalive, optional message relay.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::auth::{self, Identity};
use crate::events;
use crate::gateway::SessionHandle;
use crate::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
    user_id: Option<String>,
}

/// GET /ws — upgrade to WebSocket. Auth failure never rejects the upgrade: a
/// connection without a resolvable identity stays open unregistered and only
/// observes presence broadcasts.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity =
        auth::resolve_identity(&state.verifier, q.token.as_deref(), q.user_id.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, identity: Identity) {
    let (handle, mut rx) = state.gateway.attach(&identity);
    debug!(
        conn_id = %handle.conn_id,
        user_id = ?handle.user_id,
        verified = identity.is_verified(),
        "ws connected"
    );

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<events::ClientFrame>(&text) else {
                            continue;
                        };
                        match frame.type_.as_str() {
                            events::PING => {
                                trace!(conn_id = %handle.conn_id, "ws ping");
                                if socket.send(Message::Text(events::PONG_JSON.into())).await.is_err() {
                                    break;
                                }
                            }
                            events::MESSAGE_SEND => relay_message(&state, &handle, frame.payload),
                            _ => {}
                        }
                    }
                    Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.gateway.detach(&handle);
    debug!(conn_id = %handle.conn_id, user_id = ?handle.user_id, "ws disconnected");
}

/// Relay path: a client-sent message frame is pushed straight to the declared
/// receiver's connections, with no persistence and no check of the claimed
/// sender. Weaker than the HTTP send path on both counts; frames without a
/// string `receiver_id` are dropped.
fn relay_message(state: &AppState, handle: &SessionHandle, payload: Option<serde_json::Value>) {
    let Some(payload) = payload else { return };
    let Some(receiver_id) = payload
        .get("receiver_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
    else {
        debug!(conn_id = %handle.conn_id, "relay frame without receiver_id dropped");
        return;
    };
    let sent = state
        .gateway
        .deliver_to_user(&receiver_id, events::MESSAGE_RECEIVED, &payload);
    trace!(conn_id = %handle.conn_id, receiver_id, sent, "relayed message frame");
}

/// GET /online — Current online user ids (same data as the broadcast).
pub async fn get_online(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.gateway.online_user_ids())
}
