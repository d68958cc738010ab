use std::sync::Arc;

use cdcm_pipeline::PipelineInstance;
use metrics::Unit;

use super::PipelineProbe;
use crate::backend::MetricsBackend;
use crate::error::InstrumentationError;
use crate::tags::CommonTags;

pub const INSTANCE: &str = "cdc.instance";
pub const SUBSCRIPTIONS: &str = "cdc.instance.subscriptions";

/// Instance presence and subscription count.
pub struct MetaProbe;

impl PipelineProbe for MetaProbe {
    fn name(&self) -> &'static str {
        "meta"
    }

    fn bind(
        &self,
        instance: &dyn PipelineInstance,
        backend: &dyn MetricsBackend,
        tags: &CommonTags,
    ) -> Result<(), InstrumentationError> {
        let meta = instance.meta_manager().ok_or_else(|| {
            InstrumentationError::config(format!(
                "meta manager missing for {}",
                instance.destination()
            ))
        })?;

        backend.register_gauge(
            tags.meter(INSTANCE, "Pipeline instance")
                .tag("mode", instance.mode().as_str()),
            Arc::new(|| 1.0),
        )?;

        let destination = instance.destination().to_string();
        backend.register_gauge(
            tags.meter(SUBSCRIPTIONS, "Pipeline instance subscriptions")
                .unit(Unit::Count),
            Arc::new(move || {
                meta.list_subscriptions(&destination)
                    .map_or(0, |subs| subs.len()) as f64
            }),
        )?;
        Ok(())
    }
}
