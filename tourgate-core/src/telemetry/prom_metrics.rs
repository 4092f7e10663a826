//! Prometheus metrics using prometheus-client crate.
//!
//! [`GatewayMetrics`] registers every gateway metric on a shared
//! [`Registry`]; the proxy exposes it at the admin `/metrics` endpoint in
//! OpenMetrics text format. All label values are drawn from small fixed sets
//! (reply sources, rejection reasons, attempt outcomes), so no cardinality
//! limiting is needed.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets (prometheus-client requires #[derive(EncodeLabelSet)])
// ─────────────────────────────────────────────────────────────────────────────

/// Labels for the reply counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SourceLabels {
    /// Where the reply came from: "template", "cache", "upstream", "fallback"
    pub source: String,
}

/// Labels for admission rejections.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    /// "global_saturated", "cooldown" or "caller_saturated"
    pub reason: String,
}

/// Labels for cache lookups.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LookupLabels {
    /// "hit", "miss" or "expired"
    pub result: String,
}

/// Labels for cache evictions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EvictionLabels {
    /// "ttl" or "capacity"
    pub cause: String,
}

/// Labels for upstream attempts.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "success", "retryable" or "fatal"
    pub outcome: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Histogram Bucket Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream call duration buckets in milliseconds.
const UPSTREAM_BUCKETS: &[f64] = &[
    10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
];

// ─────────────────────────────────────────────────────────────────────────────
// GatewayMetrics
// ─────────────────────────────────────────────────────────────────────────────

/// Prometheus metrics for the gateway.
///
/// All metric names use the "tourgate_" prefix. Components hold an
/// `Arc<GatewayMetrics>` and record through the convenience methods; the
/// fields stay public so the proxy can drive the gauges it owns (uptime).
pub struct GatewayMetrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Counters
    // ─────────────────────────────────────────────────────────────────────────
    /// Replies sent, by source.
    pub requests_total: Family<SourceLabels, Counter>,

    /// Admission rejections, by reason.
    pub admission_rejections_total: Family<ReasonLabels, Counter>,

    /// Cache lookups, by result.
    pub cache_lookups_total: Family<LookupLabels, Counter>,

    /// Cache evictions, by cause.
    pub cache_evictions_total: Family<EvictionLabels, Counter>,

    /// Individual upstream attempts, by outcome.
    pub upstream_attempts_total: Family<OutcomeLabels, Counter>,

    // ─────────────────────────────────────────────────────────────────────────
    // Histograms
    // ─────────────────────────────────────────────────────────────────────────
    /// Latency of single upstream attempts in milliseconds.
    pub upstream_duration_ms: Histogram,

    // ─────────────────────────────────────────────────────────────────────────
    // Gauges
    // ─────────────────────────────────────────────────────────────────────────
    /// Entries currently held by the response cache.
    pub cache_entries: Gauge,

    /// Requests currently holding an admission permit.
    pub in_flight: Gauge,

    /// Process uptime in seconds.
    pub uptime_seconds: Gauge,
}

impl GatewayMetrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        // ─────────────────────────────────────────────────────────────────────
        // Counters
        // ─────────────────────────────────────────────────────────────────────

        let requests_total = Family::<SourceLabels, Counter>::default();
        registry.register(
            "tourgate_requests_total",
            "Chat replies sent by source",
            requests_total.clone(),
        );

        let admission_rejections_total = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "tourgate_admission_rejections_total",
            "Requests rejected by admission control",
            admission_rejections_total.clone(),
        );

        let cache_lookups_total = Family::<LookupLabels, Counter>::default();
        registry.register(
            "tourgate_cache_lookups_total",
            "Response cache lookups by result",
            cache_lookups_total.clone(),
        );

        let cache_evictions_total = Family::<EvictionLabels, Counter>::default();
        registry.register(
            "tourgate_cache_evictions_total",
            "Response cache entries evicted by cause",
            cache_evictions_total.clone(),
        );

        let upstream_attempts_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "tourgate_upstream_attempts_total",
            "Upstream completion attempts by outcome",
            upstream_attempts_total.clone(),
        );

        // ─────────────────────────────────────────────────────────────────────
        // Histograms
        // ─────────────────────────────────────────────────────────────────────

        let upstream_duration_ms = Histogram::new(UPSTREAM_BUCKETS.iter().copied());
        registry.register(
            "tourgate_upstream_duration_ms",
            "Upstream completion attempt latency in milliseconds",
            upstream_duration_ms.clone(),
        );

        // ─────────────────────────────────────────────────────────────────────
        // Gauges
        // ─────────────────────────────────────────────────────────────────────

        let cache_entries = Gauge::default();
        registry.register(
            "tourgate_cache_entries",
            "Entries currently held by the response cache",
            cache_entries.clone(),
        );

        let in_flight = Gauge::default();
        registry.register(
            "tourgate_in_flight",
            "Requests currently admitted",
            in_flight.clone(),
        );

        let uptime_seconds = Gauge::default();
        registry.register(
            "tourgate_uptime_seconds",
            "Process uptime in seconds",
            uptime_seconds.clone(),
        );

        Self {
            requests_total,
            admission_rejections_total,
            cache_lookups_total,
            cache_evictions_total,
            upstream_attempts_total,
            upstream_duration_ms,
            cache_entries,
            in_flight,
            uptime_seconds,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Record one reply sent to a client.
    pub fn record_reply(&self, source: &str) {
        self.requests_total
            .get_or_create(&SourceLabels {
                source: source.to_string(),
            })
            .inc();
    }

    /// Record one admission rejection.
    pub fn record_admission_rejection(&self, reason: &str) {
        self.admission_rejections_total
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    /// Record one cache lookup.
    pub fn record_cache_lookup(&self, result: &str) {
        self.cache_lookups_total
            .get_or_create(&LookupLabels {
                result: result.to_string(),
            })
            .inc();
    }

    /// Record `count` evicted cache entries.
    pub fn record_cache_evictions(&self, cause: &str, count: usize) {
        if count == 0 {
            return;
        }
        self.cache_evictions_total
            .get_or_create(&EvictionLabels {
                cause: cause.to_string(),
            })
            .inc_by(count as u64);
    }

    /// Record one upstream attempt and its latency.
    pub fn record_upstream_attempt(&self, outcome: &str, duration_ms: f64) {
        self.upstream_attempts_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
        self.upstream_duration_ms.observe(duration_ms);
    }
}
