//! Client-facing HTTP + WebSocket server (single port).
//!
//! Each accepted client gets its own bridge to the upstream gateway: frames
//! from the client socket go to `send_message`, notifications from the
//! bridge come back through the `create_bridge` callback, and the bridge is
//! closed when the socket goes away.

use crate::bridge::{BridgeManager, OnMessage};
use crate::config::{self, Config};
use crate::device::DeviceIdentity;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared state for the client-facing server.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub manager: BridgeManager,
    /// When Some, WebSocket upgrades must provide ?token= matching this.
    pub required_token: Option<String>,
}

/// Run the server; binds to config.server.bind:config.server.port.
/// When bind is not loopback, a server token must be configured or startup
/// fails. Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_server(config: Config) -> Result<()> {
    let bind = config.server.bind.trim().to_string();
    let required_token = config::resolve_server_token(&config);
    if !config::is_loopback_bind(&bind)
        && (required_token.is_none() || config.server.auth.mode != config::ServerAuthMode::Token)
    {
        anyhow::bail!(
            "refusing to bind to {} without auth (set server.auth.mode to \"token\" and server.auth.token or WEBBRIDGE_SERVER_TOKEN)",
            bind
        );
    }
    let required_token = if config.server.auth.mode == config::ServerAuthMode::Token {
        required_token
    } else {
        None
    };

    // No session can be authenticated without a signing identity, so a
    // failure here aborts startup.
    let identity = DeviceIdentity::generate().context("generating device identity")?;
    let manager = BridgeManager::new(
        config.gateway.url.clone(),
        config::resolve_gateway_token(&config),
        Arc::new(identity),
    );

    let port = config.server.port;
    let state = ServerState {
        config: Arc::new(config),
        manager,
        required_token,
    };

    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("webbridge listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited")?;
    log::info!("webbridge stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({
        "runtime": "running",
        "gateway": state.config.gateway.url,
        "port": state.config.server.port,
    }))
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// GET /ws upgrades to WebSocket after validating the server token.
async fn ws_handler(
    State(state): State<ServerState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(ref required) = state.required_token {
        let provided = query.token.as_deref().unwrap_or("").trim();
        if provided != required {
            log::debug!("rejecting ws upgrade: token mismatch");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

async fn handle_client(socket: WebSocket, state: ServerState) {
    let client_id = format!("web-{}", uuid::Uuid::new_v4());
    log::debug!("client connected: {}", client_id);

    let (note_tx, mut note_rx) = mpsc::unbounded_channel::<Value>();
    let on_message: OnMessage = Arc::new(move |notification| {
        let _ = note_tx.send(notification);
    });
    state.manager.create_bridge(&client_id, on_message).await;

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            notification = note_rx.recv() => {
                let Some(notification) = notification else { break };
                if sink
                    .send(Message::Text(notification.to_string()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                        Ok(msg) => state.manager.send_message(&client_id, msg).await,
                        Err(e) => log::debug!("ignoring malformed client frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("client socket error for {}: {}", client_id, e);
                        break;
                    }
                }
            }
        }
    }

    state.manager.close_bridge(&client_id).await;
    log::debug!("client disconnected: {}", client_id);
}
