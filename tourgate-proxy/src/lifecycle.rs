//! Process lifecycle of the gateway.
//!
//! ```text
//! Starting → Ready → ShuttingDown → Stopped
//! ```
//!
//! Readiness additionally requires the template table to be loaded and the
//! history store to be open. Offline mode (no upstream credentials) does not
//! affect readiness: templates and fallbacks are still served, so the
//! `upstream_configured` check is reported for visibility only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tourgate_core::AdmissionController;
use tourgate_core::config::parse_env_warn;
use tracing::{info, warn};

/// Lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Starting = 0,
    Ready = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Starting,
            1 => Self::Ready,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shutdown tuning.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long shutdown waits for admitted requests to finish.
    pub drain_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(25),
        }
    }
}

impl LifecycleConfig {
    /// Reads `TOURGATE_DRAIN_TIMEOUT_SECS`, keeping the default on bad input.
    #[must_use]
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            drain_timeout: Duration::from_secs(parse_env_warn(
                "TOURGATE_DRAIN_TIMEOUT_SECS",
                default.drain_timeout.as_secs(),
            )),
        }
    }
}

/// Individual readiness checks, serialized into `/ready`.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessChecks {
    pub templates_loaded: bool,
    pub history_ready: bool,
    /// Informational; offline mode is still ready.
    pub upstream_configured: bool,
}

impl ReadinessChecks {
    #[must_use]
    pub fn all_pass(&self) -> bool {
        self.templates_loaded && self.history_ready
    }

    #[must_use]
    pub fn first_failure(&self) -> Option<&'static str> {
        if !self.templates_loaded {
            Some("templates_loaded")
        } else if !self.history_ready {
            Some("history_ready")
        } else {
            None
        }
    }
}

/// Outcome of waiting for admitted requests during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}

/// Coordinates startup readiness and graceful shutdown.
pub struct LifecycleManager {
    state: AtomicU8,
    started_at: Instant,
    shutdown_token: CancellationToken,
    templates_loaded: AtomicBool,
    history_ready: AtomicBool,
    upstream_configured: AtomicBool,
    config: LifecycleConfig,
    version: &'static str,
}

impl LifecycleManager {
    /// Starts in [`LifecycleState::Starting`].
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Starting as u8),
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            templates_loaded: AtomicBool::new(false),
            history_ready: AtomicBool::new(false),
            upstream_configured: AtomicBool::new(false),
            config,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        )
    }

    pub fn mark_ready(&self) {
        self.state
            .store(LifecycleState::Ready as u8, Ordering::SeqCst);
        info!(
            version = %self.version,
            startup_duration_ms = self.started_at.elapsed().as_millis(),
            "TourGate ready"
        );
    }

    pub fn mark_templates_loaded(&self) {
        self.templates_loaded.store(true, Ordering::SeqCst);
    }

    pub fn mark_history_ready(&self) {
        self.history_ready.store(true, Ordering::SeqCst);
    }

    pub fn set_upstream_configured(&self, configured: bool) {
        self.upstream_configured.store(configured, Ordering::SeqCst);
    }

    /// Token shared with every background task and both servers.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Enter `ShuttingDown` and cancel the shutdown token. Idempotent.
    pub fn begin_shutdown(&self) {
        // Stopped is terminal
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                (s != LifecycleState::Stopped as u8).then_some(LifecycleState::ShuttingDown as u8)
            });
        self.shutdown_token.cancel();
        info!("Shutdown initiated");
    }

    pub fn mark_stopped(&self) {
        self.state
            .store(LifecycleState::Stopped as u8, Ordering::SeqCst);
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn version(&self) -> &'static str {
        self.version
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    #[must_use]
    pub fn readiness_checks(&self) -> ReadinessChecks {
        ReadinessChecks {
            templates_loaded: self.templates_loaded.load(Ordering::SeqCst),
            history_ready: self.history_ready.load(Ordering::SeqCst),
            upstream_configured: self.upstream_configured.load(Ordering::SeqCst),
        }
    }

    /// Wait until no admitted request is in flight, up to `drain_timeout`.
    ///
    /// Every pipeline stage runs under an admission permit, so the global
    /// in-flight count is exactly the work still owed a reply.
    pub async fn drain(&self, admission: &Arc<AdmissionController>) -> DrainResult {
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut last_log = Instant::now();

        loop {
            let active = admission.global_in_flight();
            if active == 0 {
                return DrainResult::Complete;
            }

            if Instant::now() >= deadline {
                warn!(in_flight = active, "Drain timeout exceeded, forcing shutdown");
                return DrainResult::Timeout { remaining: active };
            }

            if last_log.elapsed() >= Duration::from_secs(5) {
                info!(in_flight = active, "Draining requests...");
                last_log = Instant::now();
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
