//! Bounded, time-expiring response cache.
//!
//! Maps a [`Fingerprint`] to the upstream answer it produced. Validity is
//! decided by age at read time: an entry at least `ttl` old is a miss even if
//! the sweep has not removed it yet, and the read removes it.
//!
//! Capacity is a soft cap. When an insert or the sweep observes more than
//! `capacity` entries, the oldest `ceil(0.2 × count)` entries are evicted in
//! one batch.
//!
//! All state sits behind a single `parking_lot::Mutex`; no operation awaits
//! while holding it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::GatewayDefaults;
use crate::fingerprint::Fingerprint;
use crate::telemetry::GatewayMetrics;

/// Fraction of entries removed by one capacity eviction batch.
const EVICTION_FRACTION: f64 = 0.2;

/// Response cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entry age.
    pub ttl: Duration,
    /// Soft entry cap.
    pub capacity: usize,
    /// Interval of the background sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&GatewayDefaults::default())
    }
}

impl From<&GatewayDefaults> for CacheConfig {
    fn from(defaults: &GatewayDefaults) -> Self {
        Self {
            ttl: defaults.cache_ttl,
            capacity: defaults.cache_capacity,
            sweep_interval: defaults.cache_sweep_interval,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    response: String,
    created_at: Instant,
    /// Insertion sequence, breaks `created_at` ties so eviction order is total.
    seq: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Fingerprint, CacheEntry>,
    next_seq: u64,
}

/// Entries removed by one [`ResponseCache::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub expired: usize,
    pub evicted: usize,
}

/// Fingerprint → response store with TTL and bulk eviction.
pub struct ResponseCache {
    state: Mutex<CacheState>,
    config: CacheConfig,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl ResponseCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            config,
            metrics: None,
        }
    }

    /// Attach metrics for lookup/eviction counters and the entry gauge.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a response. Expired entries are removed and reported as a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<String> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let lookup = state.entries.get(fingerprint).map(|entry| {
            (now.saturating_duration_since(entry.created_at) < self.config.ttl)
                .then(|| entry.response.clone())
        });
        let (result, outcome) = match lookup {
            None => (None, "miss"),
            Some(None) => {
                state.entries.remove(fingerprint);
                (None, "expired")
            }
            Some(Some(response)) => (Some(response), "hit"),
        };
        let len = state.entries.len();
        drop(state);

        if let Some(ref metrics) = self.metrics {
            metrics.record_cache_lookup(outcome);
            if outcome == "expired" {
                metrics.record_cache_evictions("ttl", 1);
                metrics.cache_entries.set(len as i64);
            }
        }
        result
    }

    /// Insert or refresh a response.
    ///
    /// Triggers a capacity eviction batch if the cache grows past `capacity`.
    pub fn put(&self, fingerprint: Fingerprint, response: String) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            fingerprint,
            CacheEntry {
                response,
                created_at: now,
                seq,
            },
        );
        let evicted = self.evict_over_capacity(&mut state);
        let len = state.entries.len();
        drop(state);

        self.publish(len, 0, evicted);
    }

    /// Remove expired entries, then enforce capacity.
    pub fn sweep(&self) -> SweepOutcome {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut state = self.state.lock();

        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.created_at) < ttl);
        let expired = before - state.entries.len();
        let evicted = self.evict_over_capacity(&mut state);
        let len = state.entries.len();
        drop(state);

        if expired > 0 || evicted > 0 {
            debug!(expired, evicted, remaining = len, "Response cache swept");
        }
        self.publish(len, expired, evicted);
        SweepOutcome { expired, evicted }
    }

    /// Evict the oldest `ceil(0.2 × count)` entries when `count > capacity`.
    fn evict_over_capacity(&self, state: &mut CacheState) -> usize {
        let count = state.entries.len();
        if count <= self.config.capacity {
            return 0;
        }

        let batch = ((count as f64) * EVICTION_FRACTION).ceil() as usize;
        let mut by_age: Vec<(Instant, u64, Fingerprint)> = state
            .entries
            .iter()
            .map(|(fp, entry)| (entry.created_at, entry.seq, *fp))
            .collect();
        by_age.sort_unstable();

        for (_, _, fp) in by_age.into_iter().take(batch) {
            state.entries.remove(&fp);
        }
        batch
    }

    fn publish(&self, len: usize, expired: usize, evicted: usize) {
        if let Some(ref metrics) = self.metrics {
            metrics.cache_entries.set(len as i64);
            metrics.record_cache_evictions("ttl", expired);
            metrics.record_cache_evictions("capacity", evicted);
        }
    }

    /// Number of physically present entries, expired ones included.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweep. Stops when `shutdown` is cancelled.
    pub fn spawn_sweep_task(self: &Arc<Self>, shutdown: CancellationToken) {
        let cache = Arc::clone(self);
        let period = cache.config.sweep_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // Skip immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        cache.sweep();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Response cache sweep task shutting down");
                        break;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::CallerKey;
    use crate::conversation::Turn;

    fn fp(i: usize) -> Fingerprint {
        Fingerprint::from_turns(&CallerKey::new("c"), &[Turn::user(format!("q{i}"))])
    }

    fn cache(ttl_ms: u64, capacity: usize) -> ResponseCache {
        ResponseCache::new(CacheConfig {
            ttl: Duration::from_millis(ttl_ms),
            capacity,
            sweep_interval: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_then_expired_miss_removes_entry() {
        let cache = cache(1000, 10);
        cache.put(fp(1), "answer".to_string());
        assert_eq!(cache.get(&fp(1)).as_deref(), Some("answer"));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cache.get(&fp(1)).is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get(&fp(1)), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_refreshes_created_at() {
        let cache = cache(1000, 10);
        cache.put(fp(1), "v1".to_string());
        tokio::time::advance(Duration::from_millis(800)).await;
        cache.put(fp(1), "v2".to_string());
        tokio::time::advance(Duration::from_millis(800)).await;
        assert_eq!(cache.get(&fp(1)).as_deref(), Some("v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_evicts_oldest_batch() {
        const CAPACITY: usize = 10;
        let cache = cache(60_000, CAPACITY);
        for i in 0..=CAPACITY {
            cache.put(fp(i), format!("a{i}"));
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        // 11 entries observed → ceil(2.2) = 3 oldest evicted
        assert_eq!(cache.len(), 8);
        assert!(cache.len() <= CAPACITY);
        for i in 0..3 {
            assert_eq!(cache.get(&fp(i)), None, "entry {i} should be evicted");
        }
        for i in 3..=CAPACITY {
            assert!(cache.get(&fp(i)).is_some(), "entry {i} should survive");
        }
    }

    #[test]
    fn test_same_instant_entries_evict_in_insertion_order() {
        let cache = cache(60_000, 4);
        for i in 0..5 {
            cache.put(fp(i), format!("a{i}"));
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.get(&fp(0)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired_entries() {
        let cache = cache(1000, 10);
        cache.put(fp(1), "old".to_string());
        tokio::time::advance(Duration::from_millis(600)).await;
        cache.put(fp(2), "new".to_string());
        tokio::time::advance(Duration::from_millis(500)).await;

        let outcome = cache.sweep();
        assert_eq!(outcome, SweepOutcome { expired: 1, evicted: 0 });
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fp(2)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_task_runs_on_timer_and_stops() {
        let cache = Arc::new(ResponseCache::new(CacheConfig {
            ttl: Duration::from_millis(100),
            capacity: 10,
            sweep_interval: Duration::from_secs(1),
        }));
        let shutdown = CancellationToken::new();
        cache.spawn_sweep_task(shutdown.clone());

        cache.put(fp(1), "a".to_string());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
    }

    #[test]
    fn test_metrics_wiring() {
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Arc::new(GatewayMetrics::new(&mut registry));
        let cache = cache(60_000, 10).with_metrics(Arc::clone(&metrics));

        cache.put(fp(1), "a".to_string());
        let _ = cache.get(&fp(1));
        let _ = cache.get(&fp(2));

        assert_eq!(metrics.cache_entries.get(), 1);
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("result=\"hit\""));
        assert!(buffer.contains("result=\"miss\""));
    }
}
