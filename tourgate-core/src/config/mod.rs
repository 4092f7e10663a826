//! Gateway configuration.
//!
//! Tuning values come from the environment ([`GatewayDefaults`]); the
//! template table is loaded from YAML by [`crate::template::load_templates`].
//! Upstream connection settings live next to the client in
//! [`crate::upstream::UpstreamConfig`].

mod defaults;
mod error;

pub use defaults::GatewayDefaults;
pub use defaults::parse_env_warn;
pub use error::ConfigError;
