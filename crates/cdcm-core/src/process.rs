use std::sync::Arc;

use metrics::Unit;
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::backend::{MeterDesc, MetricsBackend};
use crate::error::BackendError;
use crate::tags::CommonTags;

pub const PROCESS_RSS: &str = "process.memory.rss";
pub const PROCESS_CPU: &str = "process.cpu.usage";
pub const PROCESS_UPTIME: &str = "process.uptime";
pub const SYSTEM_UPTIME: &str = "system.uptime";

/// Host and process gauges shared by every instance of the service.
///
/// Each scrape refreshes only the current process entry.
pub struct ProcessMetrics {
    sys: Mutex<System>,
    pid: Option<Pid>,
}

#[derive(Clone, Copy, Debug, Default)]
struct ProcessSample {
    rss_bytes: u64,
    cpu_percent: f32,
    run_secs: u64,
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMetrics {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                tracing::warn!(target: "cdcm.metrics", %err, "process metrics unavailable");
                None
            }
        };
        Self {
            sys: Mutex::new(System::new()),
            pid,
        }
    }

    fn sample(&self) -> ProcessSample {
        let Some(pid) = self.pid else {
            return ProcessSample::default();
        };
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid)
            .map(|p| ProcessSample {
                rss_bytes: p.memory(),
                cpu_percent: p.cpu_usage(),
                run_secs: p.run_time(),
            })
            .unwrap_or_default()
    }

    /// Register the process gauges under `tags`' app and host labels.
    pub fn bind(
        self: &Arc<Self>,
        backend: &dyn MetricsBackend,
        tags: &CommonTags,
    ) -> Result<(), BackendError> {
        let desc = |name: &str, help: &str, unit: Unit| {
            MeterDesc::new(name, help)
                .tags(tags.process_labels())
                .unit(unit)
        };

        let me = self.clone();
        backend.register_gauge(
            desc(PROCESS_RSS, "Resident memory of the process", Unit::Bytes),
            Arc::new(move || me.sample().rss_bytes as f64),
        )?;
        let me = self.clone();
        backend.register_gauge(
            desc(PROCESS_CPU, "CPU usage of the process", Unit::Percent),
            Arc::new(move || me.sample().cpu_percent as f64),
        )?;
        let me = self.clone();
        backend.register_gauge(
            desc(PROCESS_UPTIME, "Process uptime", Unit::Seconds),
            Arc::new(move || me.sample().run_secs as f64),
        )?;
        backend.register_gauge(
            desc(SYSTEM_UPTIME, "Host uptime", Unit::Seconds),
            Arc::new(|| System::uptime() as f64),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MeterRegistry;

    #[test]
    fn binds_process_gauges_without_destination() {
        let registry = MeterRegistry::new();
        let metrics = Arc::new(ProcessMetrics::new());
        metrics
            .bind(&registry, &CommonTags::new("cdc", "d1", "h1"))
            .unwrap();

        for name in [PROCESS_RSS, PROCESS_CPU, PROCESS_UPTIME, SYSTEM_UPTIME] {
            let value = registry.read(name, &[("app", "cdc"), ("host", "h1")]);
            assert!(value.is_some_and(|v| v >= 0.0), "{name}");
            assert!(registry.read(name, &[("destination", "d1")]).is_none());
        }
    }
}
