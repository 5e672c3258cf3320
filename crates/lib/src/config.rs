//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.webbridge/config.json`) and environment.
//! Two sections: the upstream gateway endpoint and the client-facing server.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Upstream gateway endpoint and auth.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Client-facing server settings.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Upstream gateway endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// WebSocket URL of the upstream gateway (default "ws://127.0.0.1:15151/ws").
    #[serde(default = "default_gateway_url")]
    pub url: String,

    /// Auth settings for the gateway handshake.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: optional shared token included in the connect request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// Shared secret sent (and signed) during connect. Overridden by WEBBRIDGE_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:15151/ws".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Client-facing server bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for HTTP and WebSocket (default 15252).
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_server_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: ServerAuthConfig,
}

/// Server auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require ?token= on /ws.
    #[serde(default)]
    pub mode: ServerAuthMode,

    /// Shared secret for client WebSocket upgrades. Overridden by WEBBRIDGE_SERVER_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require the configured token on every WebSocket upgrade.
    Token,
}

fn default_server_port() -> u16 {
    15252
}

fn default_server_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_server_bind(),
            auth: ServerAuthConfig::default(),
        }
    }
}

/// Resolve the gateway token: env WEBBRIDGE_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    std::env::var("WEBBRIDGE_GATEWAY_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .gateway
                .auth
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the client-facing server token: env WEBBRIDGE_SERVER_TOKEN overrides config.
pub fn resolve_server_token(config: &Config) -> Option<String> {
    std::env::var("WEBBRIDGE_SERVER_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .server
                .auth
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("WEBBRIDGE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".webbridge").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or WEBBRIDGE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
