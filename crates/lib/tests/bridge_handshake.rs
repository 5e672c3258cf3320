//! Integration tests against an in-process fake gateway: a WebSocket server
//! that issues a challenge on connect, records every inbound frame, and lets
//! the test push arbitrary frames down the current connection.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::Verifier;
use futures_util::{SinkExt, StreamExt};
use lib::bridge::{BridgeManager, OnMessage};
use lib::device::{build_connect_payload, DeviceIdentity, Signer};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

const TEST_NONCE: &str = "test-nonce";

/// Instructions for the currently active fake-gateway connection.
enum Action {
    Send(Value),
    Close,
}

struct FakeGateway {
    url: String,
    /// Every text frame any connection received, in arrival order.
    frames: mpsc::UnboundedReceiver<Value>,
    /// Control channel for the currently active connection.
    actions: mpsc::UnboundedSender<Action>,
}

impl FakeGateway {
    /// Start the fake gateway on a free port. With `auto_hello` it answers
    /// any `connect` request with a hello-shaped success; without it the
    /// test replies by hand via `send`.
    async fn spawn(auto_hello: bool) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind free port");
        let port = listener.local_addr().expect("local_addr").port();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Value>();
        let (action_tx, action_rx) = mpsc::unbounded_channel::<Action>();
        let action_rx = Arc::new(Mutex::new(action_rx));

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (mut sink, mut stream) = ws.split();
                let challenge = json!({
                    "type": "event",
                    "event": "connect.challenge",
                    "payload": { "nonce": TEST_NONCE, "ts": 1 },
                });
                if sink.send(Message::Text(challenge.to_string())).await.is_err() {
                    continue;
                }
                // one connection at a time owns the control channel
                let mut actions = action_rx.lock().await;
                loop {
                    tokio::select! {
                        action = actions.recv() => {
                            match action {
                                Some(Action::Send(frame)) => {
                                    if sink
                                        .send(Message::Text(frame.to_string()))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                // dropping the socket simulates a gateway-side
                                // transport loss
                                Some(Action::Close) => break,
                                None => return,
                            }
                        }
                        msg = stream.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    let frame: Value = match serde_json::from_str(&text) {
                                        Ok(v) => v,
                                        Err(_) => continue,
                                    };
                                    if auto_hello
                                        && frame.get("method").and_then(Value::as_str)
                                            == Some("connect")
                                    {
                                        let res = json!({
                                            "type": "res",
                                            "id": frame["id"],
                                            "ok": true,
                                            "payload": { "type": "hello-ok", "protocol": 3 },
                                        });
                                        if sink
                                            .send(Message::Text(res.to_string()))
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                    let _ = frame_tx.send(frame);
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(_)) => break,
                            }
                        }
                    }
                }
            }
        });

        FakeGateway {
            url: format!("ws://127.0.0.1:{}/ws", port),
            frames: frame_rx,
            actions: action_tx,
        }
    }

    /// Push a frame down the currently active connection.
    fn send(&self, frame: Value) {
        self.actions.send(Action::Send(frame)).expect("gateway task alive");
    }

    /// Drop the currently active connection; the accept loop keeps serving.
    fn drop_connection(&self) {
        self.actions.send(Action::Close).expect("gateway task alive");
    }
}

fn manager(gateway: &FakeGateway, token: Option<&str>) -> (BridgeManager, Arc<DeviceIdentity>) {
    let identity = Arc::new(DeviceIdentity::from_seed([9u8; 32]));
    let mgr = BridgeManager::new(
        gateway.url.clone(),
        token.map(String::from),
        identity.clone(),
    );
    (mgr, identity)
}

fn callback() -> (OnMessage, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let cb: OnMessage = Arc::new(move |notification| {
        let _ = tx.send(notification);
    });
    (cb, rx)
}

async fn recv_within(rx: &mut mpsc::UnboundedReceiver<Value>, what: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .unwrap_or_else(|| panic!("channel closed waiting for {}", what))
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Value>, what: &str) {
    if let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(300), rx.recv()).await
    {
        panic!("expected no {} but got {}", what, frame);
    }
}

#[tokio::test]
async fn connect_request_carries_verifiable_signature() {
    let mut gateway = FakeGateway::spawn(true).await;
    let (mgr, identity) = manager(&gateway, None);
    let (cb, mut notes) = callback();

    mgr.create_bridge("c1", cb).await;
    let req = recv_within(&mut gateway.frames, "connect request").await;

    assert_eq!(req["type"], "req");
    assert_eq!(req["method"], "connect");
    let params = &req["params"];
    assert_eq!(params["minProtocol"], 3);
    assert_eq!(params["maxProtocol"], 3);
    assert_eq!(params["role"], "operator");
    assert_eq!(params["scopes"], json!(["operator.read", "operator.write"]));
    assert_eq!(params["auth"]["token"], "");

    let device = &params["device"];
    assert_eq!(device["id"], identity.device_id());
    assert_eq!(device["publicKey"], identity.public_key());
    assert_eq!(device["nonce"], TEST_NONCE);

    // rebuild the canonical payload and verify the signature cryptographically
    let signed_at = device["signedAt"].as_u64().expect("signedAt");
    let payload = build_connect_payload(
        identity.device_id(),
        "cli",
        "cli",
        "operator",
        &["operator.read", "operator.write"],
        signed_at,
        "",
        TEST_NONCE,
    );
    let raw: [u8; 32] = URL_SAFE_NO_PAD
        .decode(identity.public_key())
        .unwrap()
        .try_into()
        .unwrap();
    let vk = ed25519_dalek::VerifyingKey::from_bytes(&raw).unwrap();
    let sig_bytes: [u8; 64] = URL_SAFE_NO_PAD
        .decode(device["signature"].as_str().expect("signature"))
        .unwrap()
        .try_into()
        .unwrap();
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    vk.verify(payload.as_bytes(), &sig).expect("valid signature");

    assert_eq!(
        recv_within(&mut notes, "connected notification").await,
        json!({"type": "connected"})
    );
}

#[tokio::test]
async fn queued_messages_flush_in_order_after_authentication() {
    let mut gateway = FakeGateway::spawn(false).await;
    let (mgr, _) = manager(&gateway, None);
    let (cb, mut notes) = callback();

    mgr.create_bridge("c1", cb).await;
    // hello withheld, so these sit in the queue
    mgr.send_message("c1", json!({"type": "history", "limit": 10}))
        .await;
    mgr.send_message("c1", json!({"type": "message", "text": "hello"}))
        .await;

    let connect = recv_within(&mut gateway.frames, "connect request").await;
    assert_eq!(connect["method"], "connect");
    assert_silent(&mut notes, "notification before hello").await;

    gateway.send(json!({
        "type": "res",
        "id": connect["id"],
        "ok": true,
        "payload": { "type": "hello-ok", "protocol": 3 },
    }));

    assert_eq!(
        recv_within(&mut notes, "connected notification").await,
        json!({"type": "connected"})
    );

    let history = recv_within(&mut gateway.frames, "flushed history request").await;
    assert_eq!(history["method"], "sessions.history");
    assert_eq!(history["params"]["sessionKey"], "main");
    assert_eq!(history["params"]["limit"], 10);

    let agent = recv_within(&mut gateway.frames, "flushed agent request").await;
    assert_eq!(agent["method"], "agent");
    assert_eq!(agent["params"]["message"], "hello");
    assert_eq!(agent["params"]["sessionKey"], "main");
    assert_eq!(agent["params"]["idempotencyKey"], agent["id"]);
}

#[tokio::test]
async fn internal_events_are_filtered_and_chat_forwards() {
    let mut gateway = FakeGateway::spawn(true).await;
    let (mgr, _) = manager(&gateway, None);
    let (cb, mut notes) = callback();

    mgr.create_bridge("c1", cb).await;
    assert_eq!(
        recv_within(&mut notes, "connected notification").await,
        json!({"type": "connected"})
    );

    gateway.send(json!({"type": "event", "event": "tick", "payload": {"n": 1}}));
    gateway.send(json!({
        "type": "event",
        "event": "chat",
        "payload": {"role": "assistant", "content": "hi there"},
    }));

    // the tick never shows up; the chat payload arrives unchanged
    assert_eq!(
        recv_within(&mut notes, "chat notification").await,
        json!({"role": "assistant", "content": "hi there"})
    );
    assert_silent(&mut notes, "further notification").await;
}

#[tokio::test]
async fn agent_stream_maps_to_response_then_complete() {
    let mut gateway = FakeGateway::spawn(true).await;
    let (mgr, _) = manager(&gateway, None);
    let (cb, mut notes) = callback();

    mgr.create_bridge("c1", cb).await;
    assert_eq!(
        recv_within(&mut notes, "connected notification").await,
        json!({"type": "connected"})
    );

    gateway.send(json!({
        "type": "event",
        "event": "agent",
        "payload": {"delta": {"text": "hi"}, "runId": "r1"},
    }));
    gateway.send(json!({
        "type": "event",
        "event": "agent",
        "payload": {"status": "done", "runId": "r1"},
    }));

    assert_eq!(
        recv_within(&mut notes, "streamed response").await,
        json!({"type": "response", "content": "hi", "streaming": true, "runId": "r1"})
    );
    assert_eq!(
        recv_within(&mut notes, "completion notification").await,
        json!({"type": "response_complete", "runId": "r1"})
    );
}

#[tokio::test]
async fn closed_bridge_never_notifies_and_id_can_be_reused() {
    let mut gateway = FakeGateway::spawn(true).await;
    let (mgr, _) = manager(&gateway, None);

    let (cb1, mut notes1) = callback();
    mgr.create_bridge("c1", cb1).await;
    assert_eq!(
        recv_within(&mut notes1, "first connected notification").await,
        json!({"type": "connected"})
    );

    mgr.close_bridge("c1").await;

    let (cb2, mut notes2) = callback();
    mgr.create_bridge("c1", cb2).await;
    assert_eq!(
        recv_within(&mut notes2, "second connected notification").await,
        json!({"type": "connected"})
    );

    gateway.send(json!({
        "type": "event",
        "event": "chat",
        "payload": {"role": "assistant", "content": "for the new bridge"},
    }));
    assert_eq!(
        recv_within(&mut notes2, "chat for the new bridge").await,
        json!({"role": "assistant", "content": "for the new bridge"})
    );
    assert_silent(&mut notes1, "notification for the closed bridge").await;
}

#[tokio::test]
async fn transport_loss_schedules_exactly_one_delayed_reconnect() {
    let mut gateway = FakeGateway::spawn(true).await;
    let delay = Duration::from_millis(200);
    let mgr = BridgeManager::with_reconnect_delay(
        gateway.url.clone(),
        None,
        Arc::new(DeviceIdentity::from_seed([9u8; 32])),
        delay,
    );
    let (cb, mut notes) = callback();

    mgr.create_bridge("c1", cb).await;
    let first = recv_within(&mut gateway.frames, "first connect request").await;
    assert_eq!(first["method"], "connect");
    assert_eq!(
        recv_within(&mut notes, "connected notification").await,
        json!({"type": "connected"})
    );

    let dropped_at = Instant::now();
    gateway.drop_connection();

    let second = recv_within(&mut gateway.frames, "re-dialed connect request").await;
    assert_eq!(second["method"], "connect");
    assert!(
        dropped_at.elapsed() >= delay,
        "re-dial arrived before the configured delay"
    );
    assert_eq!(
        recv_within(&mut notes, "connected after reconnect").await,
        json!({"type": "connected"})
    );

    // a second timer would produce another dial; none arrives
    assert_silent(&mut gateway.frames, "extra connect request").await;
}

#[tokio::test]
async fn close_during_reconnect_delay_cancels_the_timer() {
    let mut gateway = FakeGateway::spawn(true).await;
    let mgr = BridgeManager::with_reconnect_delay(
        gateway.url.clone(),
        None,
        Arc::new(DeviceIdentity::from_seed([9u8; 32])),
        Duration::from_millis(200),
    );
    let (cb, mut notes) = callback();

    mgr.create_bridge("c1", cb).await;
    recv_within(&mut gateway.frames, "connect request").await;
    assert_eq!(
        recv_within(&mut notes, "connected notification").await,
        json!({"type": "connected"})
    );

    gateway.drop_connection();
    // close while the reconnect timer is still pending
    tokio::time::sleep(Duration::from_millis(50)).await;
    mgr.close_bridge("c1").await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_silent(&mut gateway.frames, "connect request after close").await;
    assert_silent(&mut notes, "notification after close").await;
}

#[tokio::test]
async fn messages_to_unknown_clients_are_dropped() {
    let gateway = FakeGateway::spawn(true).await;
    let (mgr, _) = manager(&gateway, None);
    // must not panic or create state
    mgr.send_message("ghost", json!({"type": "message", "text": "anyone?"}))
        .await;
    mgr.close_bridge("ghost").await;
}
