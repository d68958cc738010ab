//! Metrics instrumentation for a change-data-capture pipeline.
//!
//! [`InstrumentationService`] owns the lifecycle. Pipeline stages are read
//! through pull-based probes, client requests are profiled through
//! [`ProfilerHook`], and everything lands in a [`MetricsBackend`].

pub mod backend;
pub mod cache;
mod config;
pub mod delay;
pub mod error;
pub mod probes;
pub mod process;
pub mod profiler;
pub mod registry;
pub mod reporter;
mod service;
pub mod tags;
pub mod util;

#[cfg(test)]
mod test_support;

pub use backend::{MeterDesc, MeterKind, MetricsBackend, Sample, Scrape, ValueFn};
pub use cache::{MetricCache, MetricHandle, MetricKey, MetricKind};
pub use config::{InfluxConfig, MetricsConfig, INFLUX_KEYS};
pub use delay::{chained_delay, elapsed_since, store_delays, Clock, ManualClock, StoreDelays, SystemClock};
pub use error::{BackendError, InstrumentationError, ResolutionError};
pub use probes::{PipelineProbe, TrafficObserver};
pub use process::ProcessMetrics;
pub use profiler::{
    ClientProfiler, ClientRequestEvent, NoopProfiler, PacketType, ProfilerHook, RequestProfiler,
};
pub use registry::MeterRegistry;
pub use reporter::{LogPublisher, Publisher, Reporter};
pub use service::{InstrumentationService, ServiceBuilder};
pub use tags::{CommonTags, FALLBACK_HOST};
