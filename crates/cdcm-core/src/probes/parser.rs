use std::sync::Arc;

use cdcm_pipeline::{ParserStage, PipelineInstance};
use metrics::Unit;

use super::{nanos_to_millis, PipelineProbe};
use crate::backend::MetricsBackend;
use crate::error::InstrumentationError;
use crate::tags::CommonTags;

pub const PUBLISH_BLOCKING: &str = "cdc.instance.publish.blocking.time";
pub const RECEIVED_BINLOG: &str = "cdc.instance.received.binlog.bytes";
pub const PARSER_MODE: &str = "cdc.instance.parser.mode";

pub struct ParserProbe;

impl PipelineProbe for ParserProbe {
    fn name(&self) -> &'static str {
        "parser"
    }

    fn bind(
        &self,
        instance: &dyn PipelineInstance,
        backend: &dyn MetricsBackend,
        tags: &CommonTags,
    ) -> Result<(), InstrumentationError> {
        let parser = match instance.parser() {
            ParserStage::Binlog(parser) => parser,
            ParserStage::Other(kind) => {
                return Err(InstrumentationError::config(format!(
                    "event parser must be a binlog parser, found {kind}"
                )))
            }
        };

        let source = parser.clone();
        backend.register_function_counter(
            tags.meter(
                PUBLISH_BLOCKING,
                "Publish blocking time of dump thread in milliseconds",
            )
            .unit(Unit::Milliseconds),
            Arc::new(move || nanos_to_millis(source.publish_blocking_nanos())),
        )?;

        let source = parser.clone();
        backend.register_function_counter(
            tags.meter(RECEIVED_BINLOG, "Received binlog bytes")
                .unit(Unit::Bytes),
            Arc::new(move || source.received_binlog_bytes() as f64),
        )?;

        // Parallelism is fixed at startup; read once.
        let parallel = if parser.is_parallel() { "true" } else { "false" };
        backend.register_gauge(
            tags.meter(PARSER_MODE, "Parser mode (parallel/serial) of instance")
                .tag("parallel", parallel),
            Arc::new(|| 1.0),
        )?;
        Ok(())
    }
}
