use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdcm_pipeline::PipelineInstance;
use metrics::{Counter, Key};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{MeterDesc, MetricsBackend, Scrape, ValueFn};
use crate::config::MetricsConfig;
use crate::delay::{Clock, SystemClock};
use crate::error::{BackendError, InstrumentationError};
use crate::probes::{default_probes, EntryProbe};
use crate::process::ProcessMetrics;
use crate::profiler::{ClientProfiler, ClientRequestEvent, ProfilerHook, RequestProfiler};
use crate::registry::MeterRegistry;
use crate::reporter::{LogPublisher, Publisher, Reporter};
use crate::tags::{local_hostname, resolve_host, CommonTags, HostResolver};

const TARGET: &str = "cdcm.metrics";

struct ReporterSettings {
    source: Arc<dyn Scrape>,
    publisher: Arc<dyn Publisher>,
    step: Duration,
}

pub struct ServiceBuilder {
    backend: Arc<dyn MetricsBackend>,
    app: String,
    clock: Arc<dyn Clock>,
    host_resolver: HostResolver,
    reporter: Option<ReporterSettings>,
}

impl ServiceBuilder {
    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn host_resolver(mut self, resolver: HostResolver) -> Self {
        self.host_resolver = resolver;
        self
    }

    /// Publish `source` through `publisher` every `step` while running.
    pub fn reporter(
        mut self,
        source: Arc<dyn Scrape>,
        publisher: Arc<dyn Publisher>,
        step: Duration,
    ) -> Self {
        self.reporter = Some(ReporterSettings {
            source,
            publisher,
            step,
        });
        self
    }

    pub fn build(self) -> InstrumentationService {
        InstrumentationService {
            profiler: Arc::new(RequestProfiler::new(self.backend.clone())),
            backend: self.backend,
            hook: Arc::new(ProfilerHook::new()),
            clock: self.clock,
            app: self.app,
            host_resolver: self.host_resolver,
            process: Arc::new(ProcessMetrics::new()),
            process_bound: AtomicBool::new(false),
            running: AtomicBool::new(false),
            instances: Mutex::new(HashMap::new()),
            reporter_settings: self.reporter,
            reporter: Mutex::new(None),
        }
    }
}

/// Lifecycle owner of the instrumentation: profiler hook, per-instance
/// probes and the metrics backend handle.
///
/// Built once by the host's composition root and shared by reference.
pub struct InstrumentationService {
    backend: Arc<dyn MetricsBackend>,
    hook: Arc<ProfilerHook>,
    profiler: Arc<RequestProfiler>,
    clock: Arc<dyn Clock>,
    app: String,
    host_resolver: HostResolver,
    process: Arc<ProcessMetrics>,
    process_bound: AtomicBool,
    running: AtomicBool,
    instances: Mutex<HashMap<String, CommonTags>>,
    reporter_settings: Option<ReporterSettings>,
    reporter: Mutex<Option<Reporter>>,
}

impl InstrumentationService {
    pub fn builder(backend: Arc<dyn MetricsBackend>) -> ServiceBuilder {
        ServiceBuilder {
            backend,
            app: MetricsConfig::default().app,
            clock: Arc::new(SystemClock),
            host_resolver: local_hostname,
            reporter: None,
        }
    }

    /// Service over a fresh in-process registry. When the backend is
    /// enabled the registry is also published every configured step.
    pub fn from_config(config: &MetricsConfig) -> Self {
        let registry = Arc::new(MeterRegistry::new());
        let builder = Self::builder(registry.clone()).app(config.app.clone());
        let builder = if config.influx.enabled {
            builder.reporter(registry, Arc::new(LogPublisher), config.step())
        } else {
            debug!(target: TARGET, "metrics publishing disabled");
            builder
        };
        builder.build()
    }

    /// Start profiling and publishing. A service whose backend has been
    /// closed stays stopped.
    pub fn initialize(&self) {
        if self.backend.is_closed() {
            warn!(target: TARGET, "metrics backend is closed; instrumentation not restarted");
            return;
        }
        if self.running.swap(true, Ordering::AcqRel) {
            debug!(target: TARGET, "instrumentation already running");
            return;
        }
        self.profiler.start();
        self.hook.install(self.profiler.clone());

        if let Some(settings) = &self.reporter_settings {
            let reporter = Reporter::spawn(
                settings.source.clone(),
                settings.publisher.clone(),
                settings.step,
            );
            *self.reporter.lock() = reporter;
        }
        info!(target: TARGET, app = %self.app, "instrumentation started");
    }

    /// Stop profiling, stop publishing and close the backend. Each step runs
    /// regardless of how the previous one went.
    pub fn terminate(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            debug!(target: TARGET, "instrumentation not running");
            return;
        }

        self.profiler.stop();
        self.hook.reset();
        debug!(target: TARGET, "request profiling deactivated");

        if let Some(reporter) = self.reporter.lock().take() {
            reporter.stop();
        }

        if !self.backend.is_closed() {
            match self.backend.close() {
                Ok(()) => debug!(target: TARGET, "metrics backend closed"),
                Err(err) => warn!(target: TARGET, %err, "closing metrics backend failed"),
            }
        }
        info!(target: TARGET, "instrumentation stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The slot the serving layer reports completed requests into.
    pub fn hook(&self) -> Arc<ProfilerHook> {
        self.hook.clone()
    }

    pub fn profile(&self, event: &ClientRequestEvent) {
        self.hook.profile(event);
    }

    pub fn backend(&self) -> &Arc<dyn MetricsBackend> {
        &self.backend
    }

    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Bind process metrics (once per service) and every stage probe of
    /// `instance`.
    ///
    /// A meter the backend refuses is logged and skipped. A probe whose
    /// stage has the wrong shape aborts the registration: the meters bound by
    /// the probes so far are removed and the error is returned.
    pub fn register(&self, instance: &dyn PipelineInstance) -> Result<(), InstrumentationError> {
        let destination = instance.destination().to_string();
        let mut instances = self.instances.lock();
        if instances.contains_key(&destination) {
            let err = InstrumentationError::config(format!(
                "destination {destination} is already registered"
            ));
            warn!(target: TARGET, %err, "instance registration refused");
            return Err(err);
        }

        let host = resolve_host(self.host_resolver);
        let tags = CommonTags::new(&self.app, &destination, &host);

        if !self.process_bound.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.process.bind(self.backend.as_ref(), &tags) {
                warn!(target: TARGET, %err, "process metrics unavailable");
                self.process_bound.store(false, Ordering::Release);
            }
        }

        let bound = Recording::new(self.backend.as_ref());
        let mut observer_installed = false;
        for probe in default_probes(self.clock.clone()) {
            match probe.bind(instance, &bound, &tags) {
                Ok(()) => observer_installed |= probe.name() == "entry",
                Err(InstrumentationError::Backend(err)) => warn!(
                    target: TARGET,
                    %err,
                    destination = %destination,
                    probe = probe.name(),
                    "probe meters rejected by backend; continuing"
                ),
                Err(err) => {
                    warn!(
                        target: TARGET,
                        %err,
                        destination = %destination,
                        probe = probe.name(),
                        "probe binding failed; rolling back instance"
                    );
                    let meters = bound.rollback();
                    if observer_installed {
                        EntryProbe::detach(instance);
                    }
                    debug!(target: TARGET, destination = %destination, meters, "partial binding removed");
                    return Err(err);
                }
            }
        }

        info!(target: TARGET, destination = %destination, host = %host, "instance instrumented");
        instances.insert(destination, tags);
        Ok(())
    }

    /// Detach everything bound for `instance`. Unknown destinations are
    /// ignored; returns whether anything was registered.
    pub fn unregister(&self, instance: &dyn PipelineInstance) -> bool {
        let destination = instance.destination();
        // Held across teardown; a register of the same destination waits.
        let mut instances = self.instances.lock();
        if instances.remove(destination).is_none() {
            debug!(target: TARGET, destination, "unregister of unknown destination ignored");
            return false;
        }
        let meters = self.backend.remove_tagged("destination", destination);
        let handles = self.profiler.forget(destination);
        EntryProbe::detach(instance);
        info!(target: TARGET, destination, meters, handles, "instance detached");
        true
    }
}

/// Backend view handed to the probes during one registration. Remembers
/// every key it registered so a failed registration can take back exactly
/// those meters.
struct Recording<'a> {
    inner: &'a dyn MetricsBackend,
    keys: Mutex<Vec<Key>>,
}

impl<'a> Recording<'a> {
    fn new(inner: &'a dyn MetricsBackend) -> Self {
        Self {
            inner,
            keys: Mutex::new(Vec::new()),
        }
    }

    fn record<T>(&self, key: Key, result: Result<T, BackendError>) -> Result<T, BackendError> {
        if result.is_ok() {
            self.keys.lock().push(key);
        }
        result
    }

    fn rollback(&self) -> usize {
        self.keys
            .lock()
            .drain(..)
            .filter(|key| self.inner.remove(key))
            .count()
    }
}

impl MetricsBackend for Recording<'_> {
    fn register_counter(&self, desc: MeterDesc) -> Result<Counter, BackendError> {
        let key = desc.key();
        self.record(key, self.inner.register_counter(desc))
    }

    fn register_function_counter(
        &self,
        desc: MeterDesc,
        value: ValueFn,
    ) -> Result<(), BackendError> {
        let key = desc.key();
        self.record(key, self.inner.register_function_counter(desc, value))
    }

    fn register_gauge(&self, desc: MeterDesc, value: ValueFn) -> Result<(), BackendError> {
        let key = desc.key();
        self.record(key, self.inner.register_gauge(desc, value))
    }

    fn remove_tagged(&self, key: &str, value: &str) -> usize {
        self.inner.remove_tagged(key, value)
    }

    fn remove(&self, key: &Key) -> bool {
        self.keys.lock().retain(|k| k != key);
        self.inner.remove(key)
    }

    fn close(&self) -> Result<(), BackendError> {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Drop for InstrumentationService {
    fn drop(&mut self) {
        if let Some(reporter) = self.reporter.get_mut().take() {
            reporter.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::ManualClock;
    use crate::error::ResolutionError;
    use crate::probes::{sink::SINK_BLOCKING, store::PUT_DELAY, TRAFFIC_OBSERVER};
    use crate::process::PROCESS_RSS;
    use crate::profiler::{PacketType, CLIENT_BYTES};
    use cdcm_pipeline::test_support::FakeInstance;

    fn service() -> (Arc<MeterRegistry>, InstrumentationService) {
        let registry = Arc::new(MeterRegistry::new());
        let service = InstrumentationService::builder(registry.clone())
            .clock(Arc::new(ManualClock::new(0)))
            .host_resolver(|| Ok("db-host".into()))
            .build();
        (registry, service)
    }

    fn request(destination: &str) -> ClientRequestEvent {
        ClientRequestEvent {
            destination: destination.into(),
            packet_type: PacketType::Messages,
            outbound_bytes: 10,
            error_code: 0,
            latency_micros: 0,
            is_empty_result: false,
        }
    }

    #[test]
    fn lifecycle_swaps_profiler_and_closes_backend() {
        let (registry, service) = service();
        assert!(!service.is_running());
        service.profile(&request("d1"));
        assert!(registry.is_empty());

        service.initialize();
        assert!(service.is_running());
        assert!(service.hook().is_active());
        service.profile(&request("d1"));
        assert_eq!(registry.read(CLIENT_BYTES, &[("destination", "d1")]), Some(10.0));

        service.terminate();
        assert!(!service.is_running());
        assert!(!service.hook().is_active());
        assert!(MetricsBackend::is_closed(registry.as_ref()));
        // Second terminate is a quiet no-op.
        service.terminate();
    }

    #[test]
    fn terminate_tolerates_an_already_closed_backend() {
        let (registry, service) = service();
        service.initialize();
        registry.close().unwrap();
        service.terminate();
        assert!(!service.is_running());
    }

    #[test]
    fn initialize_after_terminate_stays_stopped() {
        let (_registry, service) = service();
        service.initialize();
        service.terminate();
        service.initialize();
        assert!(!service.is_running());
        assert!(!service.hook().is_active());
    }

    #[test]
    fn register_tags_metrics_and_binds_process_metrics_once() {
        let (registry, service) = service();
        service.register(&FakeInstance::new("d1")).unwrap();
        service.register(&FakeInstance::new("d2")).unwrap();

        assert_eq!(
            registry.read("cdc.instance", &[("destination", "d2"), ("host", "db-host"), ("app", "cdc")]),
            Some(1.0)
        );
        assert_eq!(registry.count_named(PROCESS_RSS), 1);
        assert_eq!(service.registered(), vec!["d1", "d2"]);
    }

    #[test]
    fn unresolvable_host_uses_placeholder() {
        let registry = Arc::new(MeterRegistry::new());
        let service = InstrumentationService::builder(registry.clone())
            .host_resolver(|| Err(ResolutionError))
            .build();
        service.register(&FakeInstance::new("d1")).unwrap();
        assert!(registry
            .read("cdc.instance", &[("host", crate::tags::FALLBACK_HOST)])
            .is_some());
    }

    #[test]
    fn failing_probe_rolls_back_the_instance() {
        let (registry, service) = service();
        let instance = FakeInstance::new("d1").with_store_kind("file_mixed");
        let err = service.register(&instance).unwrap_err();
        assert!(err.is_configuration());

        assert!(instance.sink_impl.chain.is_empty());
        assert!(registry.read("cdc.instance", &[("destination", "d1")]).is_none());
        assert!(service.registered().is_empty());
    }

    #[test]
    fn failed_register_keeps_client_request_counters() {
        let (registry, service) = service();
        service.initialize();
        service.profile(&ClientRequestEvent {
            outbound_bytes: 100,
            ..request("d1")
        });

        let instance = FakeInstance::new("d1").with_store_kind("file_mixed");
        assert!(service.register(&instance).is_err());
        assert_eq!(registry.read(CLIENT_BYTES, &[("destination", "d1")]), Some(100.0));
        assert_eq!(registry.count_named(PROCESS_RSS), 1);

        service.profile(&request("d1"));
        assert_eq!(registry.read(CLIENT_BYTES, &[("destination", "d1")]), Some(110.0));
    }

    #[test]
    fn rejected_meter_does_not_abort_registration() {
        let (registry, service) = service();
        let conflicting = CommonTags::new("cdc", "d1", "db-host").meter(SINK_BLOCKING, "");
        registry.register_counter(conflicting).unwrap();

        service.register(&FakeInstance::new("d1")).unwrap();
        assert!(registry.read("cdc.instance", &[("destination", "d1")]).is_some());
        assert!(registry.read(PUT_DELAY, &[("destination", "d1")]).is_some());
        assert_eq!(registry.count_named(SINK_BLOCKING), 1);
        assert_eq!(service.registered(), vec!["d1"]);
    }

    #[test]
    fn observer_owned_elsewhere_survives_a_failed_register() {
        let (_registry, service) = service();
        let first = FakeInstance::new("d1");
        service.register(&first).unwrap();

        // Same sink, different destination name.
        let mut second = FakeInstance::new("d1-copy");
        second.sink_impl = first.sink_impl.clone();
        let err = service.register(&second).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(first.sink_impl.chain.names(), vec![TRAFFIC_OBSERVER]);
    }

    #[test]
    fn unregister_removes_meters_and_allows_rebinding() {
        let (registry, service) = service();
        let instance = FakeInstance::new("d1");
        service.initialize();
        service.register(&instance).unwrap();
        service.profile(&request("d1"));

        assert!(service.unregister(&instance));
        assert!(registry.read("cdc.instance", &[("destination", "d1")]).is_none());
        assert!(registry.read(CLIENT_BYTES, &[("destination", "d1")]).is_none());
        assert!(instance.sink_impl.chain.is_empty());
        assert_eq!(registry.count_named(PROCESS_RSS), 1);

        assert!(!service.unregister(&instance));
        service.register(&instance).unwrap();
        assert_eq!(instance.sink_impl.chain.names(), vec![TRAFFIC_OBSERVER]);
    }

    #[test]
    fn concurrent_unregister_and_register_stay_consistent() {
        let (registry, service) = service();
        let instance = FakeInstance::new("d1");
        service.register(&instance).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        service.unregister(&instance);
                        let _ = service.register(&instance);
                    }
                });
            }
        });

        let registered = service.registered() == vec!["d1"];
        assert_eq!(
            registry.read("cdc.instance", &[("destination", "d1")]).is_some(),
            registered
        );
        assert_eq!(
            registry.read(PUT_DELAY, &[("destination", "d1")]).is_some(),
            registered
        );
        assert_eq!(instance.sink_impl.chain.contains(TRAFFIC_OBSERVER), registered);
    }

    #[test]
    fn from_config_without_publishing_still_instruments() {
        let mut config = MetricsConfig::default();
        config.influx.enabled = false;
        let service = InstrumentationService::from_config(&config);
        service.initialize();
        service.register(&FakeInstance::new("d1")).unwrap();
        assert!(service.backend().remove_tagged("destination", "d1") > 0);
        service.terminate();
    }
}
