use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use cdcm_pipeline::{DownstreamHandler, EntryType, PipelineInstance, RowEvent, SinkStage};
use metrics::Unit;

use super::PipelineProbe;
use crate::backend::MetricsBackend;
use crate::delay::{elapsed_since, Clock};
use crate::error::InstrumentationError;
use crate::tags::CommonTags;

pub const TRAFFIC_DELAY: &str = "cdc.instance.traffic.delay";
pub const TRANSACTIONS: &str = "cdc.instance.transactions";

/// Chain name of the observer; at most one per sink.
pub const TRAFFIC_OBSERVER: &str = "cdcm.traffic_observer";

/// Outermost sink handler recording the newest execute time it has seen and
/// the number of transactions that passed through.
#[derive(Debug, Default)]
pub struct TrafficObserver {
    latest_execute_time: AtomicI64,
    transactions: AtomicU64,
}

impl TrafficObserver {
    pub fn latest_execute_time(&self) -> i64 {
        self.latest_execute_time.load(Ordering::Acquire)
    }

    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Acquire)
    }
}

impl DownstreamHandler for TrafficObserver {
    fn name(&self) -> &'static str {
        TRAFFIC_OBSERVER
    }

    fn before(&self, events: &[RowEvent]) {
        let Some(last) = events.last() else {
            return;
        };
        self.latest_execute_time
            .fetch_max(last.execute_time, Ordering::AcqRel);
        let ends = events
            .iter()
            .filter(|e| e.entry_type == EntryType::TransactionEnd)
            .count() as u64;
        if ends > 0 {
            self.transactions.fetch_add(ends, Ordering::AcqRel);
        }
    }
}

pub struct EntryProbe {
    clock: Arc<dyn Clock>,
}

impl EntryProbe {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Pull the observer back out of the instance's sink, if it is there.
    pub fn detach(instance: &dyn PipelineInstance) -> bool {
        match instance.sink() {
            SinkStage::Entry(sink) => sink.handlers().remove(TRAFFIC_OBSERVER) > 0,
            SinkStage::Other(_) => false,
        }
    }
}

impl PipelineProbe for EntryProbe {
    fn name(&self) -> &'static str {
        "entry"
    }

    fn bind(
        &self,
        instance: &dyn PipelineInstance,
        backend: &dyn MetricsBackend,
        tags: &CommonTags,
    ) -> Result<(), InstrumentationError> {
        let sink = match instance.sink() {
            SinkStage::Entry(sink) => sink,
            SinkStage::Other(kind) => {
                return Err(InstrumentationError::config(format!(
                    "event sink must be an entry sink, found {kind}"
                )))
            }
        };

        let observer = Arc::new(TrafficObserver::default());
        if !sink.handlers().insert_if_absent(0, observer.clone()) {
            return Err(InstrumentationError::config(format!(
                "traffic observer already installed for {}",
                instance.destination()
            )));
        }

        let clock = self.clock.clone();
        let delay_source = observer.clone();
        let delay = tags
            .meter(TRAFFIC_DELAY, "Traffic delay of the instance in milliseconds")
            .unit(Unit::Milliseconds);
        let delay_key = delay.key();
        if let Err(err) = backend.register_gauge(
            delay,
            Arc::new(move || {
                elapsed_since(clock.now_millis(), delay_source.latest_execute_time()) as f64
            }),
        ) {
            sink.handlers().remove(TRAFFIC_OBSERVER);
            return Err(err.into());
        }

        let tx_source = observer.clone();
        if let Err(err) = backend.register_function_counter(
            tags.meter(TRANSACTIONS, "Transactions counter of the instance"),
            Arc::new(move || tx_source.transactions() as f64),
        ) {
            backend.remove(&delay_key);
            sink.handlers().remove(TRAFFIC_OBSERVER);
            return Err(err.into());
        }
        Ok(())
    }
}
