//! Per-session gateway connection: state machine and transport driver.
//!
//! Transport lifecycle notifications and classified inbound frames are fed
//! through [`transition`], a pure function from (state, event) to (state,
//! effects). The async driver only dials, pumps the socket, and executes
//! effects; it holds no protocol logic of its own.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::protocol;
use super::router::{route, Routed};
use super::{send_frame, Bridge, BridgeManager};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Authenticated,
}

/// Inputs to the state machine: transport lifecycle plus classified frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnEvent {
    /// Manager-initiated connection attempt.
    Dial,
    /// Transport reported open; the gateway speaks first (challenge).
    TransportOpen,
    /// One classified inbound frame.
    Frame(Routed),
    /// Transport closed or errored.
    TransportClosed,
}

/// Side effects the driver must carry out after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Sign the challenge nonce and send the connect request.
    SendConnect { nonce: String },
    /// Notify the client it is connected, then flush the queue in FIFO order.
    FlushAndNotifyConnected,
    /// Deliver one notification to the client callback.
    Notify(Value),
    /// Arm the fixed-delay reconnect timer.
    ScheduleReconnect,
}

/// The state machine. Pure: no I/O, no clocks, no locks.
pub fn transition(state: ConnState, event: &ConnEvent) -> (ConnState, Vec<Effect>) {
    use ConnState::*;
    match (state, event) {
        (Disconnected, ConnEvent::Dial) => (Connecting, Vec::new()),
        // no transport to lose; nothing to reschedule
        (Disconnected, ConnEvent::TransportClosed) => (Disconnected, Vec::new()),
        (_, ConnEvent::TransportClosed) => (Disconnected, vec![Effect::ScheduleReconnect]),
        (Connecting, ConnEvent::TransportOpen) => (AwaitingChallenge, Vec::new()),
        (AwaitingChallenge, ConnEvent::Frame(Routed::Challenge { nonce })) => (
            Authenticating,
            vec![Effect::SendConnect {
                nonce: nonce.clone(),
            }],
        ),
        (Authenticating, ConnEvent::Frame(Routed::HelloOk)) => {
            (Authenticated, vec![Effect::FlushAndNotifyConnected])
        }
        // a rejection does not close the session; the gateway is expected to
        // drop the transport shortly after, which takes the normal close path
        (state, ConnEvent::Frame(Routed::Error(error))) => (
            state,
            vec![Effect::Notify(json!({"type": "error", "error": error}))],
        ),
        (state, ConnEvent::Frame(Routed::Forward(notification))) => {
            (state, vec![Effect::Notify(notification.clone())])
        }
        // late challenges, duplicate hello-oks, dropped frames, and
        // out-of-order lifecycle events do not move the machine
        (state, _) => (state, Vec::new()),
    }
}

impl BridgeManager {
    /// Start one connection attempt for `client_id` at `generation`.
    pub(super) fn spawn_connect(&self, client_id: String, generation: u64) {
        let mgr = self.clone();
        tokio::spawn(async move {
            mgr.run_connection(client_id, generation).await;
        });
    }

    async fn run_connection(self, client_id: String, generation: u64) {
        if !self.apply_event(&client_id, generation, ConnEvent::Dial).await {
            return;
        }
        let (ws, _) = match connect_async(self.inner.gateway_url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                log::debug!("gateway connect failed for {}: {}", client_id, e);
                self.handle_disconnect(&client_id, generation).await;
                return;
            }
        };
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        // Writer: drains the channel into the socket. Dropping the sender
        // side (on close or reconnect) ends it and closes the socket.
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        {
            let mut bridges = self.inner.bridges.write().await;
            let Some(bridge) = bridges
                .get_mut(&client_id)
                .filter(|b| b.generation == generation)
            else {
                // closed or superseded while dialing; the writer drop above
                // takes the socket down with it
                return;
            };
            bridge.tx = Some(tx);
            let (next, _) = transition(bridge.state, &ConnEvent::TransportOpen);
            bridge.state = next;
        }
        while let Some(item) = stream.next().await {
            let msg = match item {
                Ok(m) => m,
                Err(e) => {
                    log::debug!("transport error for {}: {}", client_id, e);
                    break;
                }
            };
            let Message::Text(text) = msg else { continue };
            let frame: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    // one malformed frame is dropped; the transport stays up
                    log::debug!("malformed frame for {}: {}", client_id, e);
                    continue;
                }
            };
            let event = ConnEvent::Frame(route(&frame));
            if !self.apply_event(&client_id, generation, event).await {
                // closed or superseded mid-stream; stale frames are ignored
                return;
            }
        }
        self.handle_disconnect(&client_id, generation).await;
    }

    /// Feed one event through the state machine. Returns false when the
    /// bridge no longer exists or this transport generation is stale.
    async fn apply_event(&self, client_id: &str, generation: u64, event: ConnEvent) -> bool {
        let mut bridges = self.inner.bridges.write().await;
        let Some(bridge) = bridges
            .get_mut(client_id)
            .filter(|b| b.generation == generation)
        else {
            return false;
        };
        let (next, effects) = transition(bridge.state, &event);
        bridge.state = next;
        self.run_effects(client_id, bridge, effects);
        true
    }

    /// Transport gone: reset auth, release the write handle, and let the
    /// state machine decide whether a reconnect is due.
    async fn handle_disconnect(&self, client_id: &str, generation: u64) {
        let mut bridges = self.inner.bridges.write().await;
        let Some(bridge) = bridges
            .get_mut(client_id)
            .filter(|b| b.generation == generation)
        else {
            return;
        };
        bridge.tx = None;
        let (next, effects) = transition(bridge.state, &ConnEvent::TransportClosed);
        bridge.state = next;
        self.run_effects(client_id, bridge, effects);
    }

    fn run_effects(&self, client_id: &str, bridge: &mut Bridge, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SendConnect { nonce } => {
                    let req = protocol::connect_request(
                        self.inner.signer.as_ref(),
                        self.inner.gateway_token.as_deref(),
                        &nonce,
                    );
                    match req {
                        Ok(req) => {
                            if let Some(tx) = bridge.tx.clone() {
                                send_frame(&tx, &req);
                            }
                        }
                        Err(e) => {
                            // abandon this attempt; the gateway drops idle
                            // unauthenticated transports and we reconnect
                            log::warn!("handshake signing failed for {}: {}", client_id, e);
                        }
                    }
                }
                Effect::FlushAndNotifyConnected => {
                    (bridge.on_message)(json!({"type": "connected"}));
                    if let Some(tx) = bridge.tx.clone() {
                        while let Some(msg) = bridge.queue.pop_front() {
                            let frame = super::translate::to_gateway_frame(&msg, &bridge.session_key);
                            send_frame(&tx, &frame);
                        }
                    }
                }
                Effect::Notify(notification) => (bridge.on_message)(notification),
                Effect::ScheduleReconnect => {
                    let mgr = self.clone();
                    let id = client_id.to_string();
                    let generation = bridge.generation;
                    let delay = self.inner.reconnect_delay;
                    log::debug!(
                        "reconnect for {} scheduled in {}ms",
                        client_id,
                        delay.as_millis()
                    );
                    bridge.reconnect = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        mgr.reconnect_if_current(id, generation).await;
                    }));
                }
            }
        }
    }

    /// Timer body: the session may have been closed or replaced during the
    /// delay, in which case no transport is resurrected.
    async fn reconnect_if_current(&self, client_id: String, generation: u64) {
        let next_generation = self.next_generation();
        {
            let mut bridges = self.inner.bridges.write().await;
            let Some(bridge) = bridges
                .get_mut(&client_id)
                .filter(|b| b.generation == generation)
            else {
                return;
            };
            bridge.generation = next_generation;
            bridge.reconnect = None;
        }
        self.spawn_connect(client_id, next_generation);
    }
}
