use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::Unit;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::{MeterDesc, MetricsBackend};
use crate::cache::{MetricCache, MetricHandle, MetricKey, MetricKind};
use crate::error::BackendError;

pub const CLIENT_BYTES: &str = "cdc.instance.client.bytes";
pub const CLIENT_PACKETS: &str = "cdc.instance.client.packets";
pub const CLIENT_EMPTY_BATCHES: &str = "cdc.instance.client.empty.batches";
pub const CLIENT_ERRORS: &str = "cdc.instance.client.request.error";
pub const CLIENT_LATENCY: &str = "cdc.instance.client.request.latency";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketType {
    Handshake,
    ClientAuthentication,
    Ack,
    Subscription,
    Unsubscription,
    Get,
    Messages,
    ClientAck,
    Shutdown,
    Dump,
    Heartbeat,
    ClientRollback,
}

/// One completed client interaction, as reported by the serving layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRequestEvent {
    pub destination: String,
    pub packet_type: PacketType,
    pub outbound_bytes: u64,
    /// Zero means no error.
    pub error_code: i16,
    pub latency_micros: i64,
    pub is_empty_result: bool,
}

/// What the serving layer calls once per completed request.
pub trait ClientProfiler: Send + Sync {
    fn profiling(&self, event: &ClientRequestEvent);

    fn start(&self);

    fn stop(&self);

    fn is_started(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct NoopProfiler;

impl ClientProfiler for NoopProfiler {
    fn profiling(&self, _event: &ClientRequestEvent) {}

    fn start(&self) {}

    fn stop(&self) {}

    fn is_started(&self) -> bool {
        false
    }
}

/// Turns [`ClientRequestEvent`]s into per-destination counters and a
/// last-observed latency gauge.
///
/// Never fails on the request path: a metric that cannot be registered is
/// logged and skipped while the other metrics of the same event proceed.
pub struct RequestProfiler {
    backend: Arc<dyn MetricsBackend>,
    cache: MetricCache,
    latency_cells: DashMap<String, Arc<AtomicI64>>,
    started: AtomicBool,
}

impl RequestProfiler {
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend,
            cache: MetricCache::new(),
            latency_cells: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Forget the handles of one destination so the next event re-registers.
    pub fn forget(&self, destination: &str) -> usize {
        self.latency_cells.remove(destination);
        self.cache.evict_dimension(destination)
    }

    pub fn cached_metrics(&self) -> usize {
        self.cache.len()
    }

    fn count(&self, destination: &str, kind: MetricKind, amount: u64) {
        if let Some(handle) = self.handle(destination, kind) {
            handle.increment(amount);
        }
    }

    fn handle(&self, destination: &str, kind: MetricKind) -> Option<MetricHandle> {
        let key = MetricKey::new(destination, kind);
        match self
            .cache
            .get_or_create(&key, || self.create(destination, kind))
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(
                    target: "cdcm.metrics",
                    %err,
                    destination,
                    kind = ?kind,
                    "client metric unavailable; dropping update"
                );
                None
            }
        }
    }

    fn create(&self, destination: &str, kind: MetricKind) -> Result<MetricHandle, BackendError> {
        let desc = describe(kind).tag("destination", destination);
        match kind {
            MetricKind::Latency => {
                // One cell per destination, shared by every racing factory, so
                // whichever gauge registration wins reads the retained handle.
                let cell = self
                    .latency_cells
                    .entry(destination.to_string())
                    .or_insert_with(|| Arc::new(AtomicI64::new(0)))
                    .value()
                    .clone();
                let reader = cell.clone();
                self.backend.register_gauge(
                    desc,
                    Arc::new(move || reader.load(Ordering::Relaxed) as f64),
                )?;
                Ok(MetricHandle::Gauge(cell))
            }
            _ => self
                .backend
                .register_counter(desc)
                .map(MetricHandle::Counter),
        }
    }
}

fn describe(kind: MetricKind) -> MeterDesc {
    match kind {
        MetricKind::OutboundBytes => {
            MeterDesc::new(CLIENT_BYTES, "Total bytes sent to client.").unit(Unit::Bytes)
        }
        MetricKind::PacketCount => {
            MeterDesc::new(CLIENT_PACKETS, "Total packets sent to client.").unit(Unit::Count)
        }
        MetricKind::EmptyBatchCount => {
            MeterDesc::new(CLIENT_EMPTY_BATCHES, "Total empty batches sent to client.")
                .unit(Unit::Count)
        }
        MetricKind::ErrorCount(code) => {
            MeterDesc::new(CLIENT_ERRORS, "Total client request errors.")
                .unit(Unit::Count)
                .tag("errorCode", code.to_string())
        }
        MetricKind::Latency => {
            MeterDesc::new(CLIENT_LATENCY, "Client request latency.").unit(Unit::Milliseconds)
        }
    }
}

impl ClientProfiler for RequestProfiler {
    fn profiling(&self, event: &ClientRequestEvent) {
        let destination = event.destination.as_str();

        self.count(destination, MetricKind::OutboundBytes, event.outbound_bytes);

        if event.error_code > 0 {
            self.count(destination, MetricKind::ErrorCount(event.error_code), 1);
        }

        if let Some(latency) = self.handle(destination, MetricKind::Latency) {
            latency.set(event.latency_micros / 1000);
        }

        let kind = match event.packet_type {
            PacketType::Get if event.is_empty_result => MetricKind::EmptyBatchCount,
            _ => MetricKind::PacketCount,
        };
        self.count(destination, kind, 1);
    }

    fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// The profiling slot the serving layer reports into. Starts out as a no-op.
pub struct ProfilerHook {
    current: RwLock<Arc<dyn ClientProfiler>>,
    active: AtomicBool,
}

impl Default for ProfilerHook {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(NoopProfiler)),
            active: AtomicBool::new(false),
        }
    }
}

impl ProfilerHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, profiler: Arc<dyn ClientProfiler>) {
        *self.current.write() = profiler;
        self.active.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        *self.current.write() = Arc::new(NoopProfiler);
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn profile(&self, event: &ClientRequestEvent) {
        let profiler = self.current.read().clone();
        profiler.profiling(event);
    }
}
