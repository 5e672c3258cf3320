//! webbridge core library: device identity, the gateway bridge manager,
//! and the client-facing WebSocket server used by the CLI.

pub mod bridge;
pub mod config;
pub mod device;
pub mod init;
pub mod server;
