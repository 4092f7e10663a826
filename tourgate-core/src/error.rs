//! Top-level error type for gateway startup.
//!
//! Request handling never surfaces errors to callers (every path ends in a
//! reply), so this type only covers the fallible wiring done before the
//! servers start: configuration, template loading and history store setup.

use thiserror::Error;

use crate::config::ConfigError;
use crate::history::HistoryError;

/// Failure while assembling the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("history store unavailable: {0}")]
    History(#[from] HistoryError),
}
