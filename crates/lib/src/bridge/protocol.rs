//! Gateway wire protocol types and the frozen connect parameters.
//!
//! Frames are JSON objects tagged by `type` ("req", "res", "event").
//! Field names and the connect params shape must match the upstream gateway
//! exactly; do not rename anything here without a protocol bump.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::device::{build_connect_payload, DeviceError, Signer};

/// Supported gateway protocol version (min == max).
pub const PROTOCOL_VERSION: u32 = 3;

/// Fixed client descriptor presented to the gateway.
pub const CLIENT_ID: &str = "cli";
pub const CLIENT_MODE: &str = "cli";
pub const CLIENT_PLATFORM: &str = "linux";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Role and scopes this bridge always presents as.
pub const ROLE: &str = "operator";
pub const SCOPES: [&str; 2] = ["operator.read", "operator.write"];

pub const LOCALE: &str = "en-US";
pub const USER_AGENT: &str = concat!("webbridge/", env!("CARGO_PKG_VERSION"));

/// Logical conversation key used when the client does not name one.
pub const DEFAULT_SESSION_KEY: &str = "main";

/// History page size when the client omits `limit`.
pub const DEFAULT_HISTORY_LIMIT: u64 = 50;

/// Fixed delay before re-entering Connecting after a transport loss.
pub const RECONNECT_DELAY_MS: u64 = 5000;

/// Internal gateway events never forwarded to clients.
pub const IGNORED_EVENTS: [&str; 5] = ["tick", "health", "presence", "heartbeat", "shutdown"];

/// Wire frame, both directions: `{"type":"req"|"res"|"event", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayFrame {
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Client-facing message vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Message {
        text: String,
    },
    History {
        #[serde(default)]
        limit: Option<u64>,
    },
    Typing,
}

/// Current time as Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Build the signed `connect` request answering a challenge nonce.
/// Any deviation from the canonical signing string invalidates the
/// signature on the gateway side.
pub fn connect_request(
    signer: &dyn Signer,
    token: Option<&str>,
    nonce: &str,
) -> Result<Value, DeviceError> {
    let signed_at = now_ms();
    let token = token.unwrap_or("");
    let payload = build_connect_payload(
        signer.device_id(),
        CLIENT_ID,
        CLIENT_MODE,
        ROLE,
        &SCOPES,
        signed_at,
        token,
        nonce,
    );
    let signature = signer.sign(payload.as_bytes())?;
    Ok(json!({
        "type": "req",
        "id": uuid::Uuid::new_v4().to_string(),
        "method": "connect",
        "params": {
            "minProtocol": PROTOCOL_VERSION,
            "maxProtocol": PROTOCOL_VERSION,
            "client": {
                "id": CLIENT_ID,
                "version": CLIENT_VERSION,
                "platform": CLIENT_PLATFORM,
                "mode": CLIENT_MODE,
            },
            "role": ROLE,
            "scopes": SCOPES,
            "caps": [],
            "commands": [],
            "permissions": {},
            "auth": { "token": token },
            "locale": LOCALE,
            "userAgent": USER_AGENT,
            "device": {
                "id": signer.device_id(),
                "publicKey": signer.public_key(),
                "signature": signature,
                "signedAt": signed_at,
                "nonce": nonce,
            },
        },
    }))
}
