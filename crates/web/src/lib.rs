//! uiproxy web server
//!
//! Serves each instance's container web UI under
//! `/api/instances/{id}/ui`, authenticating every request and WebSocket
//! session before anything reaches the container.

pub mod auth;
pub mod config;
pub mod error;
pub mod http_relay;
pub mod rewrite;
pub mod server;
pub mod upstream;
pub mod ws_relay;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use server::{AppState, WebServer};
pub use upstream::UpstreamPool;

/// Prefix all public routes live under.
pub const API_PREFIX: &str = "/api";

/// Public path an instance's UI is served from.
pub fn ui_base_path(instance_id: &str) -> String {
    format!("{API_PREFIX}/instances/{instance_id}/ui")
}
