//! Inbound frame classification.
//!
//! Every gateway frame falls into exactly one class: handshake challenge,
//! handshake success, request failure, streamed agent output, chat event,
//! ignorable internal event, or generic response passthrough. Only
//! explicitly recognized event names are ever forwarded, and frames that do
//! not parse as a wire frame are dropped without touching the client.

use serde_json::{json, Value};

use super::protocol::{GatewayFrame, IGNORED_EVENTS};

/// What to do with one inbound gateway frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// `connect.challenge`; drives the handshake, never forwarded.
    Challenge { nonce: String },

    /// Successful handshake response (hello-shaped payload); never forwarded raw.
    HelloOk,

    /// Request failure; forwarded as a structured error notification.
    Error(Value),

    /// Notification to deliver to the client callback.
    Forward(Value),

    /// Dropped silently.
    Drop,
}

/// Classify one inbound frame.
pub fn route(frame: &Value) -> Routed {
    match serde_json::from_value::<GatewayFrame>(frame.clone()) {
        Ok(GatewayFrame::Event { event, payload }) => route_event(&event, &payload),
        Ok(GatewayFrame::Res {
            ok, payload, error, ..
        }) => route_response(frame, ok, payload, error),
        // Requests from the gateway are not part of the client-facing contract.
        Ok(GatewayFrame::Req { .. }) => Routed::Drop,
        // A frame that does not parse as a wire frame (unknown type, missing
        // or mistyped required fields) is dropped; the transport stays up.
        Err(e) => {
            log::debug!("unroutable frame, dropping: {}", e);
            Routed::Drop
        }
    }
}

fn route_response(frame: &Value, ok: bool, payload: Option<Value>, error: Option<Value>) -> Routed {
    if !ok {
        return Routed::Error(error.unwrap_or(Value::Null));
    }
    let hello = payload
        .as_ref()
        .and_then(|p| p.get("type"))
        .and_then(Value::as_str)
        == Some("hello-ok");
    if hello {
        Routed::HelloOk
    } else {
        // Response to a request the translator issued.
        Routed::Forward(frame.clone())
    }
}

fn route_event(name: &str, payload: &Value) -> Routed {
    match name {
        "connect.challenge" => match payload.get("nonce").and_then(Value::as_str) {
            Some(nonce) => Routed::Challenge {
                nonce: nonce.to_string(),
            },
            None => {
                log::debug!("connect.challenge without nonce, dropping");
                Routed::Drop
            }
        },
        "agent" => route_agent_event(payload),
        "chat" => Routed::Forward(payload.clone()),
        n if IGNORED_EVENTS.contains(&n) => Routed::Drop,
        _ => Routed::Drop,
    }
}

fn route_agent_event(payload: &Value) -> Routed {
    let run_id = payload.get("runId").cloned().unwrap_or(Value::Null);
    if let Some(text) = payload
        .get("delta")
        .and_then(|d| d.get("text"))
        .and_then(Value::as_str)
    {
        return Routed::Forward(json!({
            "type": "response",
            "content": text,
            "streaming": true,
            "runId": run_id,
        }));
    }
    match payload.get("status").and_then(Value::as_str) {
        Some("completed") | Some("done") => Routed::Forward(json!({
            "type": "response_complete",
            "runId": run_id,
        })),
        _ => Routed::Drop,
    }
}
