//! The seam between the instrumentation core and whatever ships metrics.
//!
//! Counters come back as [`metrics::Counter`] handles so callers increment
//! them directly. Gauges and function counters are pull-based: the backend
//! keeps the supplier and evaluates it on every scrape.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::{Counter, Key, Label, Unit};
use serde::Serialize;

use crate::error::BackendError;

/// Pull-style value source evaluated on each scrape.
pub type ValueFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Name, labels, help text and unit of a meter about to be registered.
#[derive(Clone, Debug)]
pub struct MeterDesc {
    pub name: String,
    pub labels: Vec<Label>,
    pub description: String,
    pub unit: Option<Unit>,
}

impl MeterDesc {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Vec::new(),
            description: description.into(),
            unit: None,
        }
    }

    pub fn tag(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.retain(|l| l.key() != key);
        self.labels.push(Label::new(key, value.into()));
        self
    }

    pub fn tags(mut self, labels: impl IntoIterator<Item = Label>) -> Self {
        for label in labels {
            self.labels.retain(|l| l.key() != label.key());
            self.labels.push(label);
        }
        self
    }

    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Identity of the meter: name plus labels in sorted order.
    pub fn key(&self) -> Key {
        let mut labels = self.labels.clone();
        labels.sort();
        Key::from_parts(self.name.clone(), labels)
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeterKind {
    Counter,
    FunctionCounter,
    Gauge,
}

/// One scraped reading.
#[derive(Clone, Debug, Serialize)]
pub struct Sample {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub kind: MeterKind,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    pub description: String,
}

impl Sample {
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.get(key).map(String::as_str) == Some(value)
    }
}

/// Registration side of a metrics backend.
///
/// Registering a meter whose key already exists hands back the existing
/// meter rather than creating a second one.
pub trait MetricsBackend: Send + Sync {
    fn register_counter(&self, desc: MeterDesc) -> Result<Counter, BackendError>;

    fn register_function_counter(&self, desc: MeterDesc, value: ValueFn)
        -> Result<(), BackendError>;

    fn register_gauge(&self, desc: MeterDesc, value: ValueFn) -> Result<(), BackendError>;

    /// Detach every meter carrying the label `key=value`; returns how many.
    fn remove_tagged(&self, key: &str, value: &str) -> usize;

    /// Detach the single meter identified by `key`; `false` if it was absent.
    fn remove(&self, key: &Key) -> bool;

    fn close(&self) -> Result<(), BackendError>;

    fn is_closed(&self) -> bool;
}

/// Read side of a metrics backend, driven by the reporter.
pub trait Scrape: Send + Sync {
    fn snapshot(&self) -> Vec<Sample>;

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_label_order() {
        let a = MeterDesc::new("m", "").tag("b", "2").tag("a", "1");
        let b = MeterDesc::new("m", "").tag("a", "1").tag("b", "2");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn retagging_replaces_value() {
        let desc = MeterDesc::new("m", "")
            .tag("destination", "d1")
            .tag("destination", "d2");
        assert_eq!(desc.labels.len(), 1);
        assert_eq!(desc.labels[0].value(), "d2");
    }
}
