//! Per-caller and global admission control.
//!
//! Every chat request must hold an [`AdmissionPermit`] before it may touch the
//! template table, the cache or the upstream. Admission is evaluated in a
//! fixed order:
//!
//! 1. global in-flight count at the cap → [`RejectReason::GlobalSaturated`]
//! 2. caller admitted too recently → [`RejectReason::Cooldown`]
//! 3. caller in-flight count at the cap → [`RejectReason::CallerSaturated`]
//!
//! Otherwise both counters are incremented and the caller's last-request
//! timestamp is stamped. The permit releases both counters when dropped, so
//! every exit path (success, error, panic, cancelled future) releases exactly
//! once.
//!
//! This is a best-effort leaky bucket, not a fair scheduler: a rejected caller
//! is not queued and no starvation-freedom guarantee is made.
//!
//! Caller entries are created lazily. Idle entries (nothing in flight, last
//! request older than `idle_ttl`) are removed by [`AdmissionController::prune_idle`],
//! which a background task runs periodically to bound memory under high
//! caller cardinality.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GatewayDefaults;
use crate::telemetry::GatewayMetrics;

// ============================================================================
// Caller Key
// ============================================================================

/// Identifier of the originating client.
///
/// Ephemeral: used only to key in-memory admission state and the
/// conversation fingerprint, never persisted by the gateway itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerKey(String);

impl CallerKey {
    /// Key used when a request carries no usable caller identity.
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn anonymous() -> Self {
        Self(Self::ANONYMOUS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the admission controller.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Maximum in-flight requests across all callers.
    pub max_global: usize,
    /// Maximum in-flight requests per caller.
    pub max_per_caller: usize,
    /// Minimum spacing between two admissions of the same caller.
    pub cooldown: Duration,
    /// Idle time after which a caller entry is pruned.
    pub idle_ttl: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::from(&GatewayDefaults::default())
    }
}

impl From<&GatewayDefaults> for AdmissionConfig {
    fn from(defaults: &GatewayDefaults) -> Self {
        Self {
            max_global: defaults.max_global_concurrency,
            max_per_caller: defaults.max_caller_concurrency,
            cooldown: defaults.cooldown,
            idle_ttl: defaults.caller_idle_ttl,
        }
    }
}

// ============================================================================
// Rejection
// ============================================================================

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The global in-flight cap is reached.
    GlobalSaturated,
    /// The caller was admitted less than `cooldown` ago.
    Cooldown,
    /// The caller's own in-flight cap is reached.
    CallerSaturated,
}

impl RejectReason {
    /// Stable snake_case name used in logs, metrics and reply metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::GlobalSaturated => "global_saturated",
            RejectReason::Cooldown => "cooldown",
            RejectReason::CallerSaturated => "caller_saturated",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected admission attempt.
///
/// Never surfaced to clients as an error: the orchestrator maps it to a
/// friendly "busy" reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("caller '{caller}' not admitted: {reason}")]
pub struct AdmissionRejected {
    pub caller: CallerKey,
    pub reason: RejectReason,
}

// ============================================================================
// Controller
// ============================================================================

/// Per-caller admission entry.
#[derive(Debug)]
struct CallerState {
    /// Timestamp of the last admitted request, `None` before the first one.
    last_request: Option<Instant>,
    /// Requests currently holding a permit.
    in_flight: usize,
}

/// Point-in-time view of the controller's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Requests currently holding a permit.
    pub global_in_flight: usize,
    /// Number of caller entries currently tracked.
    pub tracked_callers: usize,
    /// Permits handed out since startup.
    pub admitted_total: u64,
    /// Permits released since startup.
    pub released_total: u64,
}

/// Bounds concurrent in-flight requests per caller and globally.
///
/// Global capacity is reserved with a compare-exchange loop before the
/// per-caller checks run and rolled back if they fail, so the global cap is
/// strictly enforced under concurrent access. A rolled-back reservation may
/// make a concurrent request observe saturation for an instant; that is
/// accepted for a best-effort limiter.
pub struct AdmissionController {
    callers: DashMap<CallerKey, CallerState>,
    global_in_flight: AtomicUsize,
    admitted_total: AtomicU64,
    released_total: AtomicU64,
    config: AdmissionConfig,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl AdmissionController {
    /// Create a controller with the given limits.
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            callers: DashMap::new(),
            global_in_flight: AtomicUsize::new(0),
            admitted_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
            config,
            metrics: None,
        }
    }

    /// Attach metrics for rejection counters and the in-flight gauge.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the controller configuration.
    #[must_use]
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Try to admit a request from `caller`.
    ///
    /// Returns a permit that must be held for the whole request; dropping it
    /// releases the slot. Never blocks and never awaits.
    pub fn try_admit(
        self: &Arc<Self>,
        caller: &CallerKey,
    ) -> Result<AdmissionPermit, AdmissionRejected> {
        // Step 1: atomically reserve a global slot
        loop {
            let current = self.global_in_flight.load(Ordering::Acquire);
            if current >= self.config.max_global {
                return Err(self.reject(caller, RejectReason::GlobalSaturated));
            }
            if self
                .global_in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            // CAS failed — another request changed the counter, retry
        }

        // Steps 2-4 under the caller's entry lock
        let now = Instant::now();
        let verdict = {
            let mut entry = self
                .callers
                .entry(caller.clone())
                .or_insert_with(|| CallerState {
                    last_request: None,
                    in_flight: 0,
                });

            if let Some(last) = entry.last_request
                && now.saturating_duration_since(last) < self.config.cooldown
            {
                Err(RejectReason::Cooldown)
            } else if entry.in_flight >= self.config.max_per_caller {
                Err(RejectReason::CallerSaturated)
            } else {
                entry.in_flight += 1;
                entry.last_request = Some(now);
                Ok(())
            }
        };

        if let Err(reason) = verdict {
            // Roll back the global reservation taken in step 1
            self.global_in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(self.reject(caller, reason));
        }

        self.admitted_total.fetch_add(1, Ordering::Relaxed);
        self.update_in_flight_gauge();

        Ok(AdmissionPermit {
            controller: Arc::clone(self),
            caller: caller.clone(),
            released: false,
        })
    }

    /// Release one in-flight slot held by `caller`.
    ///
    /// Only called from [`AdmissionPermit`], which guarantees exactly one
    /// release per admission. Counters saturate at zero.
    fn release(&self, caller: &CallerKey) {
        match self.callers.get_mut(caller) {
            Some(mut entry) => {
                if entry.in_flight == 0 {
                    warn!(caller = %caller, "Release without matching admission for caller");
                }
                entry.in_flight = entry.in_flight.saturating_sub(1);
            }
            None => {
                // Entries with in-flight requests are never pruned
                warn!(caller = %caller, "Release for unknown caller entry");
            }
        }

        if self
            .global_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_err()
        {
            warn!(caller = %caller, "Release with zero global in-flight count");
        }

        self.released_total.fetch_add(1, Ordering::Relaxed);
        self.update_in_flight_gauge();
    }

    fn reject(&self, caller: &CallerKey, reason: RejectReason) -> AdmissionRejected {
        debug!(
            caller = %caller,
            reason = %reason,
            global_in_flight = self.global_in_flight.load(Ordering::Relaxed),
            "Admission rejected"
        );
        if let Some(ref metrics) = self.metrics {
            metrics.record_admission_rejection(reason.as_str());
        }
        AdmissionRejected {
            caller: caller.clone(),
            reason,
        }
    }

    fn update_in_flight_gauge(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .in_flight
                .set(self.global_in_flight.load(Ordering::Relaxed) as i64);
        }
    }

    /// Current global in-flight count.
    #[must_use]
    pub fn global_in_flight(&self) -> usize {
        self.global_in_flight.load(Ordering::Acquire)
    }

    /// Current in-flight count for `caller` (0 for unknown callers).
    #[must_use]
    pub fn caller_in_flight(&self, caller: &CallerKey) -> usize {
        self.callers.get(caller).map_or(0, |entry| entry.in_flight)
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            global_in_flight: self.global_in_flight.load(Ordering::Acquire),
            tracked_callers: self.callers.len(),
            admitted_total: self.admitted_total.load(Ordering::Relaxed),
            released_total: self.released_total.load(Ordering::Relaxed),
        }
    }

    /// Remove idle caller entries.
    ///
    /// An entry is idle when nothing is in flight and its last admission is
    /// older than `idle_ttl`. Returns the number of entries removed.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let idle_ttl = self.config.idle_ttl;
        let before = self.callers.len();
        self.callers.retain(|_, state| {
            state.in_flight > 0
                || state
                    .last_request
                    .is_some_and(|last| now.saturating_duration_since(last) < idle_ttl)
        });
        let removed = before.saturating_sub(self.callers.len());
        if removed > 0 {
            debug!(
                removed,
                remaining = self.callers.len(),
                "Pruned idle admission entries"
            );
        }
        removed
    }

    /// Spawn a background task that periodically prunes idle caller entries.
    ///
    /// The task runs every `idle_ttl / 2` and stops when the cancellation
    /// token is triggered.
    pub fn spawn_prune_task(self: &Arc<Self>, shutdown: CancellationToken) {
        let controller = Arc::clone(self);
        let interval = (controller.config.idle_ttl / 2).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // Skip immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        controller.prune_idle();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Admission prune task shutting down");
                        break;
                    }
                }
            }
        });
    }
}

// ============================================================================
// Permit
// ============================================================================

/// RAII proof of admission.
///
/// Dropping the permit releases the caller's and the global slot. The permit
/// holds an `Arc` to the controller so it can move into spawned tasks.
#[must_use = "dropping the permit releases the admission slot immediately"]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    caller: CallerKey,
    released: bool,
}

impl AdmissionPermit {
    /// The caller this permit was issued to.
    pub fn caller(&self) -> &CallerKey {
        &self.caller
    }

    /// Release the slot now. Equivalent to dropping the permit.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.release(&self.caller);
        }
    }
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("caller", &self.caller)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(
        max_global: usize,
        max_per_caller: usize,
        cooldown_ms: u64,
    ) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(AdmissionConfig {
            max_global,
            max_per_caller,
            cooldown: Duration::from_millis(cooldown_ms),
            idle_ttl: Duration::from_secs(60),
        }))
    }

    fn key(s: &str) -> CallerKey {
        CallerKey::new(s)
    }

    #[test]
    fn test_admit_and_release_via_drop() {
        let ctl = controller(4, 2, 0);
        let permit = ctl.try_admit(&key("a")).expect("should admit");
        assert_eq!(ctl.global_in_flight(), 1);
        assert_eq!(ctl.caller_in_flight(&key("a")), 1);
        drop(permit);
        assert_eq!(ctl.global_in_flight(), 0);
        assert_eq!(ctl.caller_in_flight(&key("a")), 0);
    }

    #[test]
    fn test_explicit_release_is_not_repeated_on_drop() {
        let ctl = controller(4, 2, 0);
        let permit = ctl.try_admit(&key("a")).unwrap();
        permit.release();
        let stats = ctl.stats();
        assert_eq!(stats.admitted_total, 1);
        assert_eq!(stats.released_total, 1);
        assert_eq!(stats.global_in_flight, 0);
    }

    #[test]
    fn test_global_saturation_checked_first() {
        let ctl = controller(2, 2, 0);
        let _p1 = ctl.try_admit(&key("a")).unwrap();
        let _p2 = ctl.try_admit(&key("b")).unwrap();

        // Caller "a" would also fail its own checks later; global wins.
        let err = ctl.try_admit(&key("c")).unwrap_err();
        assert_eq!(err.reason, RejectReason::GlobalSaturated);
        assert_eq!(ctl.global_in_flight(), 2);
    }

    #[test]
    fn test_caller_saturation() {
        let ctl = controller(10, 1, 0);
        let _p1 = ctl.try_admit(&key("a")).unwrap();
        let err = ctl.try_admit(&key("a")).unwrap_err();
        assert_eq!(err.reason, RejectReason::CallerSaturated);
        // Rejection rolled back the global reservation
        assert_eq!(ctl.global_in_flight(), 1);
        // Other callers are unaffected
        assert!(ctl.try_admit(&key("b")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_rejects_then_admits_after_elapsed() {
        let ctl = controller(10, 5, 1000);
        let p1 = ctl.try_admit(&key("a")).unwrap();
        drop(p1);

        tokio::time::advance(Duration::from_millis(400)).await;
        let err = ctl.try_admit(&key("a")).unwrap_err();
        assert_eq!(err.reason, RejectReason::Cooldown);
        assert_eq!(ctl.global_in_flight(), 0);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(ctl.try_admit(&key("a")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_checked_before_caller_saturation() {
        let ctl = controller(10, 1, 1000);
        let _held = ctl.try_admit(&key("a")).unwrap();
        // Both cooldown and caller cap apply; cooldown is reported.
        let err = ctl.try_admit(&key("a")).unwrap_err();
        assert_eq!(err.reason, RejectReason::Cooldown);
    }

    #[test]
    fn test_release_on_panic() {
        use std::panic::AssertUnwindSafe;

        let ctl = controller(4, 2, 0);
        let ctl_clone = Arc::clone(&ctl);
        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let _permit = ctl_clone.try_admit(&key("a")).unwrap();
            panic!("Simulated panic in request handler");
        }));
        assert!(result.is_err());

        let stats = ctl.stats();
        assert_eq!(stats.global_in_flight, 0);
        assert_eq!(stats.admitted_total, stats.released_total);
    }

    #[tokio::test]
    async fn test_release_on_cancelled_future() {
        let ctl = controller(4, 2, 0);
        let ctl_clone = Arc::clone(&ctl);
        let handle = tokio::spawn(async move {
            let _permit = ctl_clone.try_admit(&CallerKey::new("a")).unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        tokio::task::yield_now().await;
        handle.abort();
        let _ = handle.await;
        assert_eq!(ctl.global_in_flight(), 0);
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_caps() {
        const MAX_GLOBAL: usize = 4;
        const MAX_PER_CALLER: usize = 2;

        let ctl = controller(MAX_GLOBAL, MAX_PER_CALLER, 0);
        let callers: Vec<CallerKey> = (0..3).map(|i| key(&format!("caller-{i}"))).collect();

        let handles: Vec<_> = (0..12)
            .map(|t| {
                let ctl = Arc::clone(&ctl);
                let caller = callers[t % callers.len()].clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if let Ok(permit) = ctl.try_admit(&caller) {
                            assert!(ctl.global_in_flight() <= MAX_GLOBAL);
                            assert!(ctl.caller_in_flight(&caller) <= MAX_PER_CALLER);
                            std::thread::yield_now();
                            drop(permit);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker thread panicked");
        }

        let stats = ctl.stats();
        assert_eq!(stats.global_in_flight, 0);
        assert_eq!(stats.admitted_total, stats.released_total);
        for caller in &callers {
            assert_eq!(ctl.caller_in_flight(caller), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_idle_keeps_busy_and_recent_entries() {
        let ctl = Arc::new(AdmissionController::new(AdmissionConfig {
            max_global: 10,
            max_per_caller: 2,
            cooldown: Duration::ZERO,
            idle_ttl: Duration::from_secs(60),
        }));

        drop(ctl.try_admit(&key("idle")).unwrap());
        let _busy = ctl.try_admit(&key("busy")).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        drop(ctl.try_admit(&key("recent")).unwrap());

        let removed = ctl.prune_idle();
        assert_eq!(removed, 1);
        assert_eq!(ctl.stats().tracked_callers, 2);
        assert_eq!(ctl.caller_in_flight(&key("busy")), 1);
    }

    #[test]
    fn test_reject_reason_names() {
        assert_eq!(RejectReason::GlobalSaturated.as_str(), "global_saturated");
        assert_eq!(RejectReason::Cooldown.as_str(), "cooldown");
        assert_eq!(RejectReason::CallerSaturated.as_str(), "caller_saturated");
    }
}
