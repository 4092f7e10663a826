//! Port configuration for the two TourGate listeners.
//!
//! | Port | Name | Purpose |
//! |------|------|---------|
//! | 7470 | Chat | `POST /chat` for the website widget |
//! | 7471 | Admin | Health checks and metrics |
//!
//! The admin port is kept off the public listener so probes and scrapes
//! never compete with chat traffic for admission slots.

use tourgate_core::config::parse_env_warn;

/// Default port of the public chat endpoint.
///
/// Configurable via `TOURGATE_CHAT_PORT`.
pub const DEFAULT_CHAT_PORT: u16 = 7470;

/// Default port of the admin server (`/health`, `/ready`, `/metrics`).
///
/// Configurable via `TOURGATE_ADMIN_PORT`.
pub const DEFAULT_ADMIN_PORT: u16 = 7471;

/// Chat port from `TOURGATE_CHAT_PORT`, or the default.
///
/// ```rust
/// use tourgate_proxy::ports::chat_port;
///
/// assert!(chat_port() > 0);
/// ```
pub fn chat_port() -> u16 {
    port_from_env("TOURGATE_CHAT_PORT", DEFAULT_CHAT_PORT)
}

/// Admin port from `TOURGATE_ADMIN_PORT`, or the default.
pub fn admin_port() -> u16 {
    port_from_env("TOURGATE_ADMIN_PORT", DEFAULT_ADMIN_PORT)
}

fn port_from_env(var: &str, default: u16) -> u16 {
    match parse_env_warn(var, default) {
        0 => {
            tracing::warn!(var, default, "Port 0 is not allowed, using default");
            default
        }
        port => port,
    }
}
