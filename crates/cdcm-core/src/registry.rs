use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{Counter, Key};

use crate::backend::{MeterDesc, MeterKind, MetricsBackend, Sample, Scrape, ValueFn};
use crate::error::BackendError;

#[derive(Clone)]
enum MeterValue {
    Counter(Arc<AtomicU64>),
    FunctionCounter(ValueFn),
    Gauge(ValueFn),
}

impl MeterValue {
    fn kind(&self) -> MeterKind {
        match self {
            MeterValue::Counter(_) => MeterKind::Counter,
            MeterValue::FunctionCounter(_) => MeterKind::FunctionCounter,
            MeterValue::Gauge(_) => MeterKind::Gauge,
        }
    }

    fn read(&self) -> f64 {
        match self {
            MeterValue::Counter(cell) => cell.load(Ordering::Acquire) as f64,
            MeterValue::FunctionCounter(f) | MeterValue::Gauge(f) => f(),
        }
    }
}

struct Meter {
    desc: MeterDesc,
    value: MeterValue,
}

/// In-process metrics backend.
///
/// Meters live until `remove` or `remove_tagged` detaches them or the
/// registry is dropped. After `close()` every registration is refused, but
/// already-registered meters can still be scraped.
#[derive(Default)]
pub struct MeterRegistry {
    meters: DashMap<Key, Meter>,
    closed: AtomicBool,
}

impl MeterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.meters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    /// Current value of the first meter named `name` carrying all `tags`.
    pub fn read(&self, name: &str, tags: &[(&str, &str)]) -> Option<f64> {
        let value = self.meters.iter().find_map(|entry| {
            let key = entry.key();
            let matches = key.name() == name
                && tags.iter().all(|(k, v)| {
                    key.labels()
                        .any(|label| label.key() == *k && label.value() == *v)
                });
            matches.then(|| entry.value().value.clone())
        })?;
        Some(value.read())
    }

    /// Number of meters named `name`, across all label sets.
    pub fn count_named(&self, name: &str) -> usize {
        self.meters.iter().filter(|e| e.key().name() == name).count()
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn register_pull(&self, desc: MeterDesc, value: MeterValue) -> Result<(), BackendError> {
        self.ensure_open()?;
        match self.meters.entry(desc.key()) {
            Entry::Occupied(existing) => {
                if existing.get().value.kind() != value.kind() {
                    return Err(BackendError::Rejected(format!(
                        "{} already registered as {:?}",
                        desc.name,
                        existing.get().value.kind()
                    )));
                }
                // First supplier wins, matching counter registration.
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(Meter { desc, value });
                Ok(())
            }
        }
    }
}

impl MetricsBackend for MeterRegistry {
    fn register_counter(&self, desc: MeterDesc) -> Result<Counter, BackendError> {
        self.ensure_open()?;
        let cell = match self.meters.entry(desc.key()) {
            Entry::Occupied(existing) => match &existing.get().value {
                MeterValue::Counter(cell) => cell.clone(),
                other => {
                    return Err(BackendError::Rejected(format!(
                        "{} already registered as {:?}",
                        desc.name,
                        other.kind()
                    )))
                }
            },
            Entry::Vacant(slot) => {
                let cell = Arc::new(AtomicU64::new(0));
                slot.insert(Meter {
                    desc,
                    value: MeterValue::Counter(cell.clone()),
                });
                cell
            }
        };
        Ok(Counter::from_arc(cell))
    }

    fn register_function_counter(
        &self,
        desc: MeterDesc,
        value: ValueFn,
    ) -> Result<(), BackendError> {
        self.register_pull(desc, MeterValue::FunctionCounter(value))
    }

    fn register_gauge(&self, desc: MeterDesc, value: ValueFn) -> Result<(), BackendError> {
        self.register_pull(desc, MeterValue::Gauge(value))
    }

    fn remove_tagged(&self, key: &str, value: &str) -> usize {
        let before = self.meters.len();
        self.meters.retain(|meter_key, _| {
            !meter_key
                .labels()
                .any(|label| label.key() == key && label.value() == value)
        });
        before.saturating_sub(self.meters.len())
    }

    fn remove(&self, key: &Key) -> bool {
        self.meters.remove(key).is_some()
    }

    fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BackendError::Closed);
        }
        tracing::debug!(target: "cdcm.metrics", meters = self.meters.len(), "meter registry closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Scrape for MeterRegistry {
    fn snapshot(&self) -> Vec<Sample> {
        // Copy the suppliers out first so none of them runs under a shard lock.
        let meters: Vec<(MeterDesc, MeterValue)> = self
            .meters
            .iter()
            .map(|entry| (entry.value().desc.clone(), entry.value().value.clone()))
            .collect();
        let mut samples: Vec<Sample> = meters
            .into_iter()
            .map(|(desc, value)| Sample {
                tags: desc
                    .labels
                    .iter()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect(),
                kind: value.kind(),
                value: value.read(),
                unit: desc.unit.map(|u| u.as_str()),
                name: desc.name,
                description: desc.description,
            })
            .collect();
        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        samples
    }

    fn is_closed(&self) -> bool {
        MetricsBackend::is_closed(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::Unit;

    #[test]
    fn duplicate_counter_registration_shares_one_cell() {
        let registry = MeterRegistry::new();
        let a = registry
            .register_counter(MeterDesc::new("hits", "").tag("destination", "d1"))
            .unwrap();
        let b = registry
            .register_counter(MeterDesc::new("hits", "").tag("destination", "d1"))
            .unwrap();
        a.increment(2);
        b.increment(3);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.read("hits", &[("destination", "d1")]), Some(5.0));
    }

    #[test]
    fn gauge_keeps_first_supplier() {
        let registry = MeterRegistry::new();
        registry
            .register_gauge(MeterDesc::new("g", ""), Arc::new(|| 1.0))
            .unwrap();
        registry
            .register_gauge(MeterDesc::new("g", ""), Arc::new(|| 2.0))
            .unwrap();
        assert_eq!(registry.read("g", &[]), Some(1.0));
    }

    #[test]
    fn kind_conflict_is_rejected() {
        let registry = MeterRegistry::new();
        registry.register_counter(MeterDesc::new("m", "")).unwrap();
        let err = registry
            .register_gauge(MeterDesc::new("m", ""), Arc::new(|| 0.0))
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[test]
    fn closed_registry_refuses_registration() {
        let registry = MeterRegistry::new();
        registry.close().unwrap();
        assert_eq!(
            registry.register_counter(MeterDesc::new("m", "")).err(),
            Some(BackendError::Closed)
        );
        assert_eq!(registry.close().unwrap_err(), BackendError::Closed);
    }

    #[test]
    fn remove_tagged_only_detaches_matching_meters() {
        let registry = MeterRegistry::new();
        registry
            .register_counter(MeterDesc::new("m", "").tag("destination", "d1"))
            .unwrap();
        registry
            .register_counter(MeterDesc::new("m", "").tag("destination", "d2"))
            .unwrap();
        assert_eq!(registry.remove_tagged("destination", "d1"), 1);
        assert_eq!(registry.read("m", &[("destination", "d1")]), None);
        assert!(registry.read("m", &[("destination", "d2")]).is_some());
    }

    #[test]
    fn remove_detaches_exactly_one_key() {
        let registry = MeterRegistry::new();
        let d1 = MeterDesc::new("m", "").tag("destination", "d1");
        registry.register_counter(d1.clone()).unwrap();
        registry
            .register_counter(MeterDesc::new("m", "").tag("destination", "d2"))
            .unwrap();
        assert!(registry.remove(&d1.key()));
        assert!(!registry.remove(&d1.key()));
        assert_eq!(registry.read("m", &[("destination", "d1")]), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_reports_units_and_pull_values() {
        let registry = MeterRegistry::new();
        let counter = registry
            .register_counter(MeterDesc::new("bytes", "sent").unit(Unit::Bytes))
            .unwrap();
        counter.increment(10);
        registry
            .register_function_counter(MeterDesc::new("rows", "rows"), Arc::new(|| 7.0))
            .unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "bytes");
        assert_eq!(snapshot[0].value, 10.0);
        assert_eq!(snapshot[0].unit, Some("bytes"));
        assert_eq!(snapshot[1].kind, MeterKind::FunctionCounter);
        assert_eq!(snapshot[1].value, 7.0);
    }
}
