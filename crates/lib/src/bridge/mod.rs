//! Bridge connection manager: one upstream gateway connection per client.
//!
//! The manager owns the client-id to bridge map; all cross-session access
//! goes through `create_bridge` / `send_message` / `close_bridge`. Each
//! bridge runs its own connect, challenge, authenticate cycle and holds
//! a FIFO queue for messages submitted before authentication completes.

mod connection;
mod protocol;
mod router;
mod translate;

pub use connection::{transition, ConnEvent, ConnState, Effect};
pub use protocol::{
    connect_request, ClientMessage, GatewayFrame, CLIENT_ID, CLIENT_MODE, CLIENT_PLATFORM,
    CLIENT_VERSION, DEFAULT_HISTORY_LIMIT, DEFAULT_SESSION_KEY, IGNORED_EVENTS, LOCALE,
    PROTOCOL_VERSION, RECONNECT_DELAY_MS, ROLE, SCOPES, USER_AGENT,
};
pub use router::{route, Routed};
pub use translate::to_gateway_frame;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::device::Signer;

/// Callback delivering client-facing notifications (data, errors, status).
/// Invoked at most once per logical event and never after `close_bridge`.
pub type OnMessage = Arc<dyn Fn(Value) + Send + Sync>;

/// One client session: transport handle, auth state, and pending queue.
struct Bridge {
    on_message: OnMessage,
    /// Write handle for the current transport; None while disconnected.
    tx: Option<mpsc::UnboundedSender<Message>>,
    state: ConnState,
    /// Messages submitted before authentication, flushed FIFO. Unbounded by
    /// design: a sustained outage grows this with client send rate.
    queue: VecDeque<Value>,
    session_key: String,
    /// Tags the current transport; tasks from an older transport check it
    /// and stand down instead of touching a session they no longer own.
    generation: u64,
    /// Pending fixed-delay reconnect, if armed.
    reconnect: Option<JoinHandle<()>>,
}

struct Inner {
    bridges: RwLock<HashMap<String, Bridge>>,
    signer: Arc<dyn Signer>,
    gateway_url: String,
    gateway_token: Option<String>,
    generations: AtomicU64,
    reconnect_delay: Duration,
}

/// Shared handle to the manager; cheap to clone into connection tasks.
#[derive(Clone)]
pub struct BridgeManager {
    inner: Arc<Inner>,
}

impl BridgeManager {
    pub fn new(
        gateway_url: impl Into<String>,
        gateway_token: Option<String>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self::with_reconnect_delay(
            gateway_url,
            gateway_token,
            signer,
            Duration::from_millis(RECONNECT_DELAY_MS),
        )
    }

    /// Like [`new`](Self::new) with an explicit reconnect delay. Tests use a
    /// short delay; production callers stick with the default.
    pub fn with_reconnect_delay(
        gateway_url: impl Into<String>,
        gateway_token: Option<String>,
        signer: Arc<dyn Signer>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bridges: RwLock::new(HashMap::new()),
                signer,
                gateway_url: gateway_url.into(),
                gateway_token,
                generations: AtomicU64::new(0),
                reconnect_delay,
            }),
        }
    }

    /// Install a bridge for `client_id` and start connecting. An existing
    /// bridge under the same id is closed first (replace-on-create).
    pub async fn create_bridge(&self, client_id: &str, on_message: OnMessage) {
        self.close_bridge(client_id).await;
        let generation = self.next_generation();
        let bridge = Bridge {
            on_message,
            tx: None,
            state: ConnState::Disconnected,
            queue: VecDeque::new(),
            session_key: DEFAULT_SESSION_KEY.to_string(),
            generation,
            reconnect: None,
        };
        self.inner
            .bridges
            .write()
            .await
            .insert(client_id.to_string(), bridge);
        log::info!("bridge created for {}", client_id);
        self.spawn_connect(client_id.to_string(), generation);
    }

    /// Submit one client message. Sent immediately when authenticated on a
    /// live transport; queued when the handshake is still pending or the
    /// transport is mid-reconnect; dropped (logged) for unknown clients.
    pub async fn send_message(&self, client_id: &str, msg: Value) {
        let mut bridges = self.inner.bridges.write().await;
        let Some(bridge) = bridges.get_mut(client_id) else {
            log::debug!("send_message for unknown client {}, dropping", client_id);
            return;
        };
        if bridge.state == ConnState::Authenticated {
            if let Some(tx) = bridge.tx.as_ref() {
                let frame = to_gateway_frame(&msg, &bridge.session_key);
                if send_frame(tx, &frame) {
                    return;
                }
                // writer already gone; fall through and queue for the
                // transport that replaces it
            }
        }
        bridge.queue.push_back(msg);
    }

    /// Tear down the bridge for `client_id`. Idempotent; never fails. No
    /// callback fires for this client afterward.
    pub async fn close_bridge(&self, client_id: &str) {
        let removed = self.inner.bridges.write().await.remove(client_id);
        if let Some(bridge) = removed {
            if let Some(timer) = bridge.reconnect {
                timer.abort();
            }
            // dropping `tx` ends the writer task, which closes the socket
            log::info!("bridge closed for {}", client_id);
        }
    }

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Serialize and hand a frame to the writer task. Returns false when the
/// frame was not delivered, whether the writer went away or encoding failed.
fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &Value) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => tx.send(Message::Text(text)).is_ok(),
        Err(e) => {
            log::warn!("failed to encode outbound frame: {}", e);
            false
        }
    }
}
