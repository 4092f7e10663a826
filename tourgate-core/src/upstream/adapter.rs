//! Retrying wrapper around a [`CompletionService`].
//!
//! For `attempt = 1..=max_attempts` the service is called once. Success
//! returns immediately. A retryable failure with attempts left sleeps
//! `base_delay × 2^(attempt−1)` (plus optional jitter) and tries again; a
//! non-retryable failure or the last attempt ends the call with an
//! [`UpstreamFailure`] tagged by the last error's [`FailureKind`].
//!
//! The whole loop, sleeps included, runs under `budget`. When the budget
//! expires the call fails with [`FailureKind::NetworkOrTimeout`] whatever
//! attempt was in progress.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CompletionError, CompletionRequest, CompletionService, FailureKind, UpstreamFailure};
use crate::config::GatewayDefaults;
use crate::telemetry::GatewayMetrics;

/// Retry schedule for upstream calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per call, first attempt included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later attempt.
    pub base_delay: Duration,
    /// Wall-clock budget for all attempts and sleeps.
    pub budget: Duration,
    /// Add up to 25% random extra delay to each backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&GatewayDefaults::default())
    }
}

impl From<&GatewayDefaults> for RetryPolicy {
    fn from(defaults: &GatewayDefaults) -> Self {
        Self {
            max_attempts: defaults.max_attempts,
            base_delay: defaults.base_delay,
            budget: defaults.upstream_budget,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Deterministic backoff after failed attempt `attempt` (1-based):
    /// `base_delay × 2^(attempt−1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Backoff including jitter when enabled.
    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if !self.jitter {
            return delay;
        }
        let max_extra = (delay.as_millis() / 4) as u64;
        if max_extra == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=max_extra))
    }
}

/// A successful upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSuccess {
    pub text: String,
    /// Attempts it took, first attempt included.
    pub attempts: u32,
}

/// Progress of one call, readable after the budget timeout drops the loop.
#[derive(Default)]
struct CallState {
    attempts: u32,
    last_error: Option<CompletionError>,
}

/// Retries a [`CompletionService`] according to a [`RetryPolicy`].
#[derive(Clone)]
pub struct UpstreamAdapter {
    service: Arc<dyn CompletionService>,
    policy: RetryPolicy,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl UpstreamAdapter {
    pub fn new(service: Arc<dyn CompletionService>, policy: RetryPolicy) -> Self {
        Self {
            service,
            policy,
            metrics: None,
        }
    }

    /// Attach metrics for attempt counters and latency.
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call the service with retries under the total budget.
    #[tracing::instrument(skip_all, fields(correlation_id = %correlation_id))]
    pub async fn call(
        &self,
        request: &CompletionRequest,
        correlation_id: &str,
    ) -> Result<UpstreamSuccess, UpstreamFailure> {
        let mut state = CallState::default();
        let outcome =
            tokio::time::timeout(self.policy.budget, self.retry_loop(request, &mut state)).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    attempts = state.attempts,
                    budget_ms = self.policy.budget.as_millis() as u64,
                    "Upstream budget exhausted"
                );
                Err(UpstreamFailure {
                    kind: FailureKind::NetworkOrTimeout,
                    attempts: state.attempts,
                    last_error: state.last_error,
                })
            }
        }
    }

    async fn retry_loop(
        &self,
        request: &CompletionRequest,
        state: &mut CallState,
    ) -> Result<UpstreamSuccess, UpstreamFailure> {
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            state.attempts = attempt;
            let started = Instant::now();
            let result = self.service.complete(request).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            let error = match result {
                Ok(text) => {
                    self.record_attempt("success", elapsed_ms);
                    debug!(attempt, "Upstream attempt succeeded");
                    return Ok(UpstreamSuccess {
                        text,
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            let retryable = error.is_retryable();
            self.record_attempt(if retryable { "retryable" } else { "fatal" }, elapsed_ms);

            if !retryable || attempt == max_attempts {
                warn!(
                    attempt,
                    max_attempts,
                    retryable,
                    error = %error,
                    "Upstream call failed"
                );
                return Err(UpstreamFailure {
                    kind: error.kind(),
                    attempts: attempt,
                    last_error: Some(error),
                });
            }

            let mut backoff = self.policy.backoff(attempt);
            if let CompletionError::RateLimited {
                retry_after: Some(hint),
            } = &error
            {
                backoff = backoff.max(*hint);
            }
            warn!(
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Upstream attempt failed, retrying"
            );
            state.last_error = Some(error);
            tokio::time::sleep(backoff).await;
        }

        // Only reachable with max_attempts == 0, which config validation rejects
        Err(UpstreamFailure {
            kind: FailureKind::Unknown,
            attempts: 0,
            last_error: state.last_error.take(),
        })
    }

    fn record_attempt(&self, outcome: &str, elapsed_ms: f64) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_upstream_attempt(outcome, elapsed_ms);
        }
    }
}
