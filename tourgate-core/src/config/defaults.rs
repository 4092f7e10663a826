//! Centralized default values for TourGate gateway tuning.
//!
//! Every knob the pipeline exposes lives here with its documented default.
//! Values are read once at startup; components receive the parts they need
//! as plain config structs so they stay testable in isolation.

use std::time::Duration;
use tracing::warn;

use super::error::ConfigError;

/// Centralized gateway tuning values.
///
/// These defaults are used when explicit configuration is not provided.
/// Use [`GatewayDefaults::from_env`] followed by [`GatewayDefaults::validate`]
/// at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDefaults {
    /// Maximum in-flight requests across all callers.
    pub max_global_concurrency: usize,

    /// Maximum in-flight requests for a single caller.
    pub max_caller_concurrency: usize,

    /// Minimum spacing between two admitted requests of the same caller.
    pub cooldown: Duration,

    /// Idle time after which a caller's admission entry may be pruned.
    /// Must exceed `cooldown`, otherwise pruning would defeat the cooldown.
    pub caller_idle_ttl: Duration,

    /// Maximum age of a cached response.
    pub cache_ttl: Duration,

    /// Soft entry cap of the response cache.
    pub cache_capacity: usize,

    /// Interval of the background cache sweep.
    pub cache_sweep_interval: Duration,

    /// Number of trailing turns that feed the conversation fingerprint.
    pub fingerprint_turns: usize,

    /// Upstream attempts per request, first attempt included.
    pub max_attempts: u32,

    /// Base delay of the exponential backoff between upstream attempts.
    pub base_delay: Duration,

    /// Wall-clock budget covering all upstream attempts and backoff sleeps.
    pub upstream_budget: Duration,

    /// Maximum number of conversation turns accepted per request.
    pub max_turns: usize,

    /// Largest `/chat` body read; bigger bodies get a fallback reply.
    pub max_body_bytes: usize,

    /// Sessions kept by the in-memory history store.
    pub history_max_sessions: usize,
}

impl Default for GatewayDefaults {
    fn default() -> Self {
        Self {
            max_global_concurrency: 16,
            max_caller_concurrency: 2,
            cooldown: Duration::from_millis(1000),
            caller_idle_ttl: Duration::from_secs(600), // 10 minutes
            cache_ttl: Duration::from_millis(600_000), // 10 minutes
            cache_capacity: 500,
            cache_sweep_interval: Duration::from_secs(60),
            fingerprint_turns: 3,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            upstream_budget: Duration::from_secs(30),
            max_turns: 30,
            max_body_bytes: 256 * 1024, // 256 KiB
            history_max_sessions: 10_000,
        }
    }
}

impl GatewayDefaults {
    /// Create defaults from environment variables.
    ///
    /// Invalid values are logged and replaced by the default; they never
    /// abort startup on their own. Call [`validate`](Self::validate) after.
    ///
    /// # Environment Variables
    /// - `TOURGATE_MAX_GLOBAL_CONCURRENCY`
    /// - `TOURGATE_MAX_CALLER_CONCURRENCY`
    /// - `TOURGATE_COOLDOWN_MS`
    /// - `TOURGATE_CALLER_IDLE_SECS`
    /// - `TOURGATE_CACHE_TTL_MS`
    /// - `TOURGATE_CACHE_CAPACITY`
    /// - `TOURGATE_CACHE_SWEEP_SECS`
    /// - `TOURGATE_FINGERPRINT_TURNS`
    /// - `TOURGATE_MAX_ATTEMPTS`
    /// - `TOURGATE_BASE_DELAY_MS`
    /// - `TOURGATE_UPSTREAM_BUDGET_SECS`
    /// - `TOURGATE_MAX_TURNS`
    /// - `TOURGATE_MAX_BODY_BYTES`
    /// - `TOURGATE_HISTORY_MAX_SESSIONS`
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_global_concurrency: parse_env_warn(
                "TOURGATE_MAX_GLOBAL_CONCURRENCY",
                default.max_global_concurrency,
            ),

            max_caller_concurrency: parse_env_warn(
                "TOURGATE_MAX_CALLER_CONCURRENCY",
                default.max_caller_concurrency,
            ),

            cooldown: Duration::from_millis(parse_env_warn(
                "TOURGATE_COOLDOWN_MS",
                default.cooldown.as_millis() as u64,
            )),

            caller_idle_ttl: Duration::from_secs(parse_env_warn(
                "TOURGATE_CALLER_IDLE_SECS",
                default.caller_idle_ttl.as_secs(),
            )),

            cache_ttl: Duration::from_millis(parse_env_warn(
                "TOURGATE_CACHE_TTL_MS",
                default.cache_ttl.as_millis() as u64,
            )),

            cache_capacity: parse_env_warn("TOURGATE_CACHE_CAPACITY", default.cache_capacity),

            cache_sweep_interval: Duration::from_secs(parse_env_warn(
                "TOURGATE_CACHE_SWEEP_SECS",
                default.cache_sweep_interval.as_secs(),
            )),

            fingerprint_turns: parse_env_warn(
                "TOURGATE_FINGERPRINT_TURNS",
                default.fingerprint_turns,
            ),

            max_attempts: parse_env_warn("TOURGATE_MAX_ATTEMPTS", default.max_attempts),

            base_delay: Duration::from_millis(parse_env_warn(
                "TOURGATE_BASE_DELAY_MS",
                default.base_delay.as_millis() as u64,
            )),

            upstream_budget: Duration::from_secs(parse_env_warn(
                "TOURGATE_UPSTREAM_BUDGET_SECS",
                default.upstream_budget.as_secs(),
            )),

            max_turns: parse_env_warn("TOURGATE_MAX_TURNS", default.max_turns),

            max_body_bytes: parse_env_warn("TOURGATE_MAX_BODY_BYTES", default.max_body_bytes),

            history_max_sessions: parse_env_warn(
                "TOURGATE_HISTORY_MAX_SESSIONS",
                default.history_max_sessions,
            ),
        }
    }

    /// Validate the defaults satisfy invariants.
    ///
    /// # Invariants
    /// 1. Concurrency caps, cache capacity, attempts, turn, body and
    ///    session limits are >= 1
    /// 2. `max_caller_concurrency` <= `max_global_concurrency`
    /// 3. `caller_idle_ttl` > `cooldown`
    /// 4. `fingerprint_turns` <= `max_turns`
    /// 5. Sweep interval and upstream budget are non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_global_concurrency", self.max_global_concurrency),
            ("max_caller_concurrency", self.max_caller_concurrency),
            ("cache_capacity", self.cache_capacity),
            ("fingerprint_turns", self.fingerprint_turns),
            ("max_attempts", self.max_attempts as usize),
            ("max_turns", self.max_turns),
            ("max_body_bytes", self.max_body_bytes),
            ("history_max_sessions", self.history_max_sessions),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: "must be at least 1".to_string(),
                });
            }
        }

        if self.max_caller_concurrency > self.max_global_concurrency {
            return Err(ConfigError::InvalidValue {
                field: "max_caller_concurrency",
                message: format!(
                    "{} exceeds max_global_concurrency ({})",
                    self.max_caller_concurrency, self.max_global_concurrency
                ),
            });
        }

        if self.caller_idle_ttl <= self.cooldown {
            return Err(ConfigError::InvalidValue {
                field: "caller_idle_ttl",
                message: format!(
                    "{:?} must be greater than cooldown ({:?})",
                    self.caller_idle_ttl, self.cooldown
                ),
            });
        }

        if self.fingerprint_turns > self.max_turns {
            return Err(ConfigError::InvalidValue {
                field: "fingerprint_turns",
                message: format!(
                    "{} exceeds max_turns ({})",
                    self.fingerprint_turns, self.max_turns
                ),
            });
        }

        if self.cache_sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "cache_sweep_interval",
                message: "must be non-zero".to_string(),
            });
        }

        if self.upstream_budget.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "upstream_budget",
                message: "must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Parse an environment variable with a warning on invalid values.
///
/// Unset variables yield `default` silently; unparsable ones log a warning
/// and yield `default`.
pub fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(
    name: &str,
    default: T,
) -> T {
    match std::env::var(name) {
        Ok(val) => match val.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let defaults = GatewayDefaults::default();

        assert_eq!(defaults.max_global_concurrency, 16);
        assert_eq!(defaults.max_caller_concurrency, 2);
        assert_eq!(defaults.cooldown, Duration::from_millis(1000));
        assert_eq!(defaults.caller_idle_ttl, Duration::from_secs(600));
        assert_eq!(defaults.cache_ttl, Duration::from_secs(600));
        assert_eq!(defaults.cache_capacity, 500);
        assert_eq!(defaults.cache_sweep_interval, Duration::from_secs(60));
        assert_eq!(defaults.fingerprint_turns, 3);
        assert_eq!(defaults.max_attempts, 3);
        assert_eq!(defaults.base_delay, Duration::from_millis(500));
        assert_eq!(defaults.upstream_budget, Duration::from_secs(30));
        assert_eq!(defaults.max_turns, 30);
        assert_eq!(defaults.max_body_bytes, 256 * 1024);
        assert_eq!(defaults.history_max_sessions, 10_000);
    }

    #[test]
    fn test_defaults_validate_ok() {
        assert!(GatewayDefaults::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let defaults = GatewayDefaults {
            cache_capacity: 0,
            ..Default::default()
        };
        match defaults.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "cache_capacity"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_caller_cap_above_global() {
        let defaults = GatewayDefaults {
            max_global_concurrency: 2,
            max_caller_concurrency: 3,
            ..Default::default()
        };
        assert!(defaults.validate().is_err());
    }

    #[test]
    fn test_validate_idle_ttl_not_above_cooldown() {
        let defaults = GatewayDefaults {
            cooldown: Duration::from_secs(10),
            caller_idle_ttl: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(defaults.validate().is_err());
    }

    #[test]
    fn test_validate_fingerprint_turns_above_max_turns() {
        let defaults = GatewayDefaults {
            fingerprint_turns: 40,
            ..Default::default()
        };
        assert!(defaults.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides_and_invalid_values() {
        // SAFETY: Test runs serially via #[serial], env var mutation is isolated
        unsafe {
            std::env::set_var("TOURGATE_MAX_GLOBAL_CONCURRENCY", "64");
            std::env::set_var("TOURGATE_COOLDOWN_MS", "250");
            std::env::set_var("TOURGATE_CACHE_CAPACITY", "not-a-number");
        }

        let defaults = GatewayDefaults::from_env();

        // SAFETY: see above
        unsafe {
            std::env::remove_var("TOURGATE_MAX_GLOBAL_CONCURRENCY");
            std::env::remove_var("TOURGATE_COOLDOWN_MS");
            std::env::remove_var("TOURGATE_CACHE_CAPACITY");
        }

        assert_eq!(defaults.max_global_concurrency, 64);
        assert_eq!(defaults.cooldown, Duration::from_millis(250));
        // Invalid value falls back to the default
        assert_eq!(defaults.cache_capacity, 500);
    }
}
