//! HTTP message endpoints: persist first, then push to the receiver's live
//! connections.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::events::{self, ChatMessage};
use crate::{AppState, MAX_MESSAGES_LIMIT};

#[derive(Deserialize)]
pub struct SendMessageBody {
    receiver_id: String,
    text: String,
}

/// POST /messages — Persist a message, then push it to the receiver's live
/// connections. A push to zero connections is fine: the store is the source
/// of truth and an offline receiver catches up on reconnect, so push outcome
/// never turns into an API error.
pub async fn post_message(
    CurrentUser(uid): CurrentUser,
    State(state): State<AppState>,
    Json(body): Json<SendMessageBody>,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    let receiver_id = body.receiver_id.trim();
    if receiver_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "receiver_id cannot be empty"));
    }
    if body.text.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Message cannot be empty"));
    }

    let msg = ChatMessage {
        id: Uuid::new_v4(),
        sender_id: uid,
        receiver_id: receiver_id.to_string(),
        text: body.text,
        sent_at: Utc::now(),
    };

    state.store.append(msg.clone()).await;
    let sent = state
        .gateway
        .deliver_to_user(&msg.receiver_id, events::MESSAGE_RECEIVED, &msg);
    tracing::debug!(receiver_id = %msg.receiver_id, sent, "message persisted and pushed");

    Ok((StatusCode::CREATED, Json(msg)))
}

#[derive(Deserialize)]
pub struct PeerPath {
    peer_id: String,
}

/// GET /messages/{peer_id} — Conversation with one peer, oldest first.
pub async fn get_conversation(
    CurrentUser(uid): CurrentUser,
    State(state): State<AppState>,
    Path(PeerPath { peer_id }): Path<PeerPath>,
) -> Json<Vec<ChatMessage>> {
    Json(state.store.conversation(&uid, &peer_id, MAX_MESSAGES_LIMIT).await)
}
