use std::sync::Arc;

use cdcm_pipeline::{PipelineInstance, SinkStage};
use metrics::Unit;

use super::{nanos_to_millis, PipelineProbe};
use crate::backend::MetricsBackend;
use crate::error::InstrumentationError;
use crate::tags::CommonTags;

pub const SINK_BLOCKING: &str = "cdc.instance.sink.blocking.time";

pub struct SinkProbe;

impl PipelineProbe for SinkProbe {
    fn name(&self) -> &'static str {
        "sink"
    }

    fn bind(
        &self,
        instance: &dyn PipelineInstance,
        backend: &dyn MetricsBackend,
        tags: &CommonTags,
    ) -> Result<(), InstrumentationError> {
        let SinkStage::Entry(sink) = instance.sink() else {
            return Err(InstrumentationError::config(format!(
                "event sink must be an entry sink, found {}",
                instance.sink().kind()
            )));
        };
        backend.register_function_counter(
            tags.meter(SINK_BLOCKING, "Total sink blocking time in milliseconds")
                .unit(Unit::Milliseconds),
            Arc::new(move || nanos_to_millis(sink.sink_blocking_nanos())),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MeterRegistry;
    use cdcm_pipeline::test_support::FakeInstance;
    use std::sync::atomic::Ordering;

    #[test]
    fn reports_blocking_time_in_millis() {
        let instance = FakeInstance::new("d1");
        let registry = MeterRegistry::new();
        SinkProbe
            .bind(&instance, &registry, &CommonTags::new("cdc", "d1", "h"))
            .unwrap();
        instance
            .sink_impl
            .blocking_nanos
            .store(3_500_000, Ordering::Relaxed);
        assert_eq!(registry.read(SINK_BLOCKING, &[]), Some(3.0));
    }
}
