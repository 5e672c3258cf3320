//! Outbound translation: client vocabulary to gateway request frames.

use serde_json::{json, Value};

use super::protocol::{ClientMessage, DEFAULT_HISTORY_LIMIT};

/// Convert one client message into the frame to send upstream.
///
/// `message` and `history` become requests with fresh ids; anything else is
/// treated as an already-complete frame and forwarded unchanged. The
/// idempotency key mirrors the request id so a retried send is deduplicated
/// by the gateway.
pub fn to_gateway_frame(msg: &Value, session_key: &str) -> Value {
    match serde_json::from_value::<ClientMessage>(msg.clone()) {
        Ok(ClientMessage::Message { text }) => {
            let id = uuid::Uuid::new_v4().to_string();
            json!({
                "type": "req",
                "id": id,
                "method": "agent",
                "params": {
                    "message": text,
                    "sessionKey": session_key,
                    "idempotencyKey": id,
                },
            })
        }
        Ok(ClientMessage::History { limit }) => json!({
            "type": "req",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": "sessions.history",
            "params": {
                "sessionKey": session_key,
                "limit": limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
            },
        }),
        _ => msg.clone(),
    }
}
