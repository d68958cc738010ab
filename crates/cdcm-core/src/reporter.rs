use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{Sample, Scrape};
use crate::error::BackendError;

/// Receives each scraped batch. The wire protocol lives behind this trait.
pub trait Publisher: Send + Sync {
    fn publish(&self, batch: &[Sample]) -> Result<(), BackendError>;
}

/// Writes batches to the `cdcm.metrics` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, batch: &[Sample]) -> Result<(), BackendError> {
        let body = serde_json::to_string(batch)
            .map_err(|err| BackendError::Rejected(format!("metrics batch: {err}")))?;
        debug!(target: "cdcm.metrics", samples = batch.len(), %body, "metrics batch");
        Ok(())
    }
}

/// Periodic scrape-and-publish task.
pub struct Reporter {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Reporter {
    /// Start reporting every `step` on the current runtime. Returns `None`
    /// when called outside a tokio runtime.
    pub fn spawn(
        source: Arc<dyn Scrape>,
        publisher: Arc<dyn Publisher>,
        step: Duration,
    ) -> Option<Self> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(target: "cdcm.metrics", %err, "no async runtime; metrics reporter not started");
                return None;
            }
        };
        let step = step.max(Duration::from_millis(1));
        let stop = Arc::new(Notify::new());
        let signal = stop.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = interval(step);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(target: "cdcm.metrics", step_ms = step.as_millis() as u64, "metrics reporter started");
            loop {
                tokio::select! {
                    _ = signal.notified() => {
                        debug!(target: "cdcm.metrics", "metrics reporter stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if source.is_closed() {
                            debug!(target: "cdcm.metrics", "metrics source closed");
                            break;
                        }
                        let batch = source.snapshot();
                        if let Err(err) = publisher.publish(&batch) {
                            warn!(target: "cdcm.metrics", %err, samples = batch.len(), "metrics publish failed");
                        }
                    }
                }
            }
        });
        Some(Self { stop, handle })
    }

    /// Ask the task to stop after its current tick.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    pub async fn shutdown(self) {
        self.stop();
        if let Err(err) = self.handle.await {
            warn!(target: "cdcm.metrics", %err, "metrics reporter task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MeterDesc, MetricsBackend};
    use crate::registry::MeterRegistry;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Vec<Sample>>>);

    impl Publisher for Collect {
        fn publish(&self, batch: &[Sample]) -> Result<(), BackendError> {
            self.0.lock().push(batch.to_vec());
            Ok(())
        }
    }

    struct Failing;

    impl Publisher for Failing {
        fn publish(&self, _batch: &[Sample]) -> Result<(), BackendError> {
            Err(BackendError::Rejected("endpoint down".into()))
        }
    }

    #[tokio::test]
    async fn publishes_snapshots_until_shutdown() {
        let registry = Arc::new(MeterRegistry::new());
        registry
            .register_gauge(MeterDesc::new("g", "").tag("destination", "d1"), Arc::new(|| 7.0))
            .unwrap();
        let sink = Arc::new(Collect::default());
        let reporter =
            Reporter::spawn(registry.clone(), sink.clone(), Duration::from_millis(5)).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        reporter.shutdown().await;

        let batches = sink.0.lock();
        assert!(!batches.is_empty());
        let sample = &batches[0][0];
        assert_eq!(sample.name, "g");
        assert_eq!(sample.value, 7.0);
        assert!(sample.has_tag("destination", "d1"));
    }

    #[tokio::test]
    async fn stops_when_source_closes() {
        let registry = Arc::new(MeterRegistry::new());
        let reporter = Reporter::spawn(
            registry.clone(),
            Arc::new(LogPublisher),
            Duration::from_millis(5),
        )
        .unwrap();
        registry.close().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(reporter.is_finished());
    }

    #[tokio::test]
    async fn publish_failures_do_not_stop_the_loop() {
        let registry = Arc::new(MeterRegistry::new());
        let reporter =
            Reporter::spawn(registry, Arc::new(Failing), Duration::from_millis(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!reporter.is_finished());
        reporter.shutdown().await;
    }

    #[test]
    fn spawn_outside_runtime_is_refused() {
        let registry = Arc::new(MeterRegistry::new());
        assert!(Reporter::spawn(registry, Arc::new(LogPublisher), Duration::from_secs(1)).is_none());
    }

    #[test]
    fn log_publisher_accepts_batches() {
        let registry = MeterRegistry::new();
        registry
            .register_gauge(MeterDesc::new("g", ""), Arc::new(|| 1.0))
            .unwrap();
        assert!(LogPublisher.publish(&registry.snapshot()).is_ok());
    }
}
