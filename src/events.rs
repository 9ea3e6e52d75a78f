//! Wire frames for the WebSocket channel, plus the chat message envelope.
//!
//! Every frame is JSON of the shape `{"type": <event>, "payload": <data>}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server -> client: refreshed list of online user ids.
pub const ONLINE_USERS: &str = "getOnlineUsers";
/// Server -> client: a message envelope pushed to its receiver.
pub const MESSAGE_RECEIVED: &str = "message:received";
/// Client -> server: relay a message frame straight to its receiver.
pub const MESSAGE_SEND: &str = "message:send";
/// Client -> server keepalive.
pub const PING: &str = "ping";

pub const PONG_JSON: &str = r#"{"type":"pong"}"#;

/// Serialize an event frame once; fan-out paths send the same string to every
/// target connection.
pub fn frame<T: Serialize>(event: &str, payload: &T) -> serde_json::Result<String> {
    #[derive(Serialize)]
    struct Frame<'a, T> {
        #[serde(rename = "type")]
        type_: &'a str,
        payload: &'a T,
    }
    serde_json::to_string(&Frame {
        type_: event,
        payload,
    })
}

/// Inbound client frame. The payload stays raw until the type is known.
#[derive(Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// One direct message between two users. Persisted by the store before the
/// gateway pushes it; the gateway itself treats it as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_shape() {
        let json = frame(ONLINE_USERS, &vec!["u1", "u2"]).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "getOnlineUsers");
        assert_eq!(v["payload"], serde_json::json!(["u1", "u2"]));
    }

    #[test]
    fn client_frame_without_payload() {
        let f: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(f.type_, PING);
        assert!(f.payload.is_none());
    }
}
