//! Binders that attach pull-based metrics to the stages of one pipeline
//! instance.
//!
//! Each probe checks that its stage is the variant it knows how to read and
//! fails with a configuration error otherwise. Probes bind once per instance
//! and are never rebound.

use std::sync::Arc;

use cdcm_pipeline::PipelineInstance;

use crate::backend::MetricsBackend;
use crate::delay::Clock;
use crate::error::InstrumentationError;
use crate::tags::CommonTags;

pub mod entry;
pub mod meta;
pub mod parser;
pub mod sink;
pub mod store;

pub use entry::{EntryProbe, TrafficObserver, TRAFFIC_OBSERVER};
pub use meta::MetaProbe;
pub use parser::ParserProbe;
pub use sink::SinkProbe;
pub use store::StoreProbe;

const NANOS_PER_MILLI: u64 = 1_000_000;

pub trait PipelineProbe: Send + Sync {
    fn name(&self) -> &'static str;

    fn bind(
        &self,
        instance: &dyn PipelineInstance,
        backend: &dyn MetricsBackend,
        tags: &CommonTags,
    ) -> Result<(), InstrumentationError>;
}

/// Every probe, in binding order: entry, metadata, parser, sink, store.
pub fn default_probes(clock: Arc<dyn Clock>) -> Vec<Box<dyn PipelineProbe>> {
    vec![
        Box::new(EntryProbe::new(clock.clone())),
        Box::new(MetaProbe),
        Box::new(ParserProbe),
        Box::new(SinkProbe),
        Box::new(StoreProbe::new(clock)),
    ]
}

fn nanos_to_millis(nanos: u64) -> f64 {
    (nanos / NANOS_PER_MILLI) as f64
}
