use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::Counter;

use crate::error::BackendError;

/// Per-destination metric the client profiler maintains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    OutboundBytes,
    PacketCount,
    EmptyBatchCount,
    /// Each error code gets its own counter.
    ErrorCount(i16),
    Latency,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub dimension: String,
    pub kind: MetricKind,
}

impl MetricKey {
    pub fn new(dimension: &str, kind: MetricKind) -> Self {
        Self {
            dimension: dimension.to_string(),
            kind,
        }
    }
}

/// Handle to a metric already registered with the backend.
#[derive(Clone)]
pub enum MetricHandle {
    Counter(Counter),
    /// Cell read by a pull gauge the backend holds.
    Gauge(Arc<AtomicI64>),
}

impl MetricHandle {
    pub fn increment(&self, amount: u64) {
        match self {
            MetricHandle::Counter(counter) => counter.increment(amount),
            MetricHandle::Gauge(_) => {
                tracing::debug!(target: "cdcm.metrics", "increment ignored on gauge handle")
            }
        }
    }

    pub fn set(&self, value: i64) {
        match self {
            MetricHandle::Gauge(cell) => cell.store(value, Ordering::Relaxed),
            MetricHandle::Counter(_) => {
                tracing::debug!(target: "cdcm.metrics", "set ignored on counter handle")
            }
        }
    }
}

/// Lazily populated map from [`MetricKey`] to its handle.
///
/// The factory runs outside any lock. Two threads racing on the same absent
/// key may both run it; only the first installed handle is kept and every
/// caller gets that one back. Factories must therefore be free of side
/// effects other than building the handle (backend registration is
/// idempotent per key).
#[derive(Default)]
pub struct MetricCache {
    entries: DashMap<MetricKey, MetricHandle>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<F>(&self, key: &MetricKey, factory: F) -> Result<MetricHandle, BackendError>
    where
        F: FnOnce() -> Result<MetricHandle, BackendError>,
    {
        if let Some(existing) = self.entries.get(key) {
            return Ok(existing.value().clone());
        }
        let created = factory()?;
        let winner = self.entries.entry(key.clone()).or_insert(created);
        Ok(winner.value().clone())
    }

    pub fn get(&self, key: &MetricKey) -> Option<MetricHandle> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Drop every entry for `dimension`; returns how many were removed.
    pub fn evict_dimension(&self, dimension: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.dimension != dimension);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MeterDesc, MetricsBackend};
    use crate::registry::MeterRegistry;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn second_lookup_skips_factory() {
        let cache = MetricCache::new();
        let key = MetricKey::new("d1", MetricKind::Latency);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_create(&key, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(MetricHandle::Gauge(Arc::new(AtomicI64::new(0))))
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn factory_error_leaves_cache_empty() {
        let cache = MetricCache::new();
        let key = MetricKey::new("d1", MetricKind::PacketCount);
        let err = cache
            .get_or_create(&key, || Err(BackendError::Closed))
            .err();
        assert_eq!(err, Some(BackendError::Closed));
        assert!(cache.is_empty());
    }

    #[test]
    fn racing_first_use_converges_on_one_handle() {
        const THREADS: usize = 8;
        const PER_THREAD: u64 = 250;
        let registry = MeterRegistry::new();
        let cache = MetricCache::new();
        let key = MetricKey::new("d1", MetricKind::PacketCount);
        let barrier = Barrier::new(THREADS);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    barrier.wait();
                    for _ in 0..PER_THREAD {
                        let handle = cache
                            .get_or_create(&key, || {
                                registry
                                    .register_counter(
                                        MeterDesc::new("packets", "").tag("destination", "d1"),
                                    )
                                    .map(MetricHandle::Counter)
                            })
                            .unwrap();
                        handle.increment(1);
                    }
                });
            }
        });

        assert_eq!(cache.len(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.read("packets", &[("destination", "d1")]),
            Some((THREADS as u64 * PER_THREAD) as f64)
        );
    }

    #[test]
    fn evict_dimension_keeps_other_destinations() {
        let cache = MetricCache::new();
        for dest in ["d1", "d2"] {
            for kind in [MetricKind::PacketCount, MetricKind::ErrorCount(404)] {
                cache
                    .get_or_create(&MetricKey::new(dest, kind), || {
                        Ok(MetricHandle::Gauge(Arc::new(AtomicI64::new(0))))
                    })
                    .unwrap();
            }
        }
        assert_eq!(cache.evict_dimension("d1"), 2);
        assert!(cache
            .get(&MetricKey::new("d2", MetricKind::ErrorCount(404)))
            .is_some());
        assert!(cache
            .get(&MetricKey::new("d1", MetricKind::PacketCount))
            .is_none());
    }
}
