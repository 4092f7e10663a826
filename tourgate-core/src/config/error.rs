//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
///
/// All of these are startup errors: the gateway refuses to start rather
/// than run with a configuration it cannot honour.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Value validation errors
    // ─────────────────────────────────────────────────────────────────────────
    /// A tuning value violates its invariant.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },

    /// An environment variable is set but cannot be parsed.
    #[error("environment variable '{var}' must be {expected}, got: '{value}'")]
    InvalidEnvVar {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    /// Upstream base URL cannot be parsed.
    #[error("invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Template table errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Template file does not exist.
    #[error("template file not found: {path}")]
    TemplateFileNotFound { path: PathBuf },

    /// Template entry normalizes to an empty prompt.
    #[error("template entry #{index} has an empty prompt after normalization")]
    EmptyTemplatePrompt { index: usize },

    /// Template file contains no entries.
    #[error("template file is empty")]
    EmptyTemplateFile,

    // ─────────────────────────────────────────────────────────────────────────
    // I/O and parsing errors
    // ─────────────────────────────────────────────────────────────────────────
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_saphyr::Error),

    /// I/O error reading a configuration file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "cache_capacity",
            message: "must be at least 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for cache_capacity: must be at least 1"
        );
    }

    #[test]
    fn test_invalid_env_var_display() {
        let err = ConfigError::InvalidEnvVar {
            var: "TOURGATE_REQUEST_TIMEOUT_SECS",
            expected: "a valid integer",
            value: "soon".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("TOURGATE_REQUEST_TIMEOUT_SECS"));
        assert!(msg.contains("soon"));
    }
}
