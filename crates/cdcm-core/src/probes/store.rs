use std::sync::Arc;

use cdcm_pipeline::{BufferedStore, PipelineInstance, StoreStage};
use metrics::Unit;

use super::PipelineProbe;
use crate::backend::{MetricsBackend, ValueFn};
use crate::delay::{store_delays, Clock, StoreDelays};
use crate::error::InstrumentationError;
use crate::tags::CommonTags;

pub const PRODUCE_SEQ: &str = "cdc.instance.store.produce.seq";
pub const CONSUME_SEQ: &str = "cdc.instance.store.consume.seq";
pub const STORE: &str = "cdc.instance.store";
pub const PRODUCE_MEM: &str = "cdc.instance.store.produce.mem";
pub const CONSUME_MEM: &str = "cdc.instance.store.consume.mem";
pub const PUT_DELAY: &str = "cdc.instance.put.delay";
pub const GET_DELAY: &str = "cdc.instance.get.delay";
pub const ACK_DELAY: &str = "cdc.instance.ack.delay";
pub const PUT_ROWS: &str = "cdc.instance.put.rows";
pub const GET_ROWS: &str = "cdc.instance.get.rows";
pub const ACK_ROWS: &str = "cdc.instance.ack.rows";

/// Sequence, occupancy, memory, delay and row metrics of the memory buffer.
pub struct StoreProbe {
    clock: Arc<dyn Clock>,
}

impl StoreProbe {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn delay_gauge(
        &self,
        store: &Arc<dyn BufferedStore>,
        pick: fn(&StoreDelays) -> u64,
    ) -> ValueFn {
        let store = store.clone();
        let clock = self.clock.clone();
        Arc::new(move || pick(&store_delays(clock.now_millis(), store.timestamps())) as f64)
    }
}

fn read_u64(store: &Arc<dyn BufferedStore>, read: fn(&dyn BufferedStore) -> u64) -> ValueFn {
    let store = store.clone();
    Arc::new(move || read(store.as_ref()) as f64)
}

impl PipelineProbe for StoreProbe {
    fn name(&self) -> &'static str {
        "store"
    }

    fn bind(
        &self,
        instance: &dyn PipelineInstance,
        backend: &dyn MetricsBackend,
        tags: &CommonTags,
    ) -> Result<(), InstrumentationError> {
        let store = match instance.store() {
            StoreStage::MemoryBuffer(store) => store,
            StoreStage::Other(kind) => {
                return Err(InstrumentationError::config(format!(
                    "event store must be a memory buffer, found {kind}"
                )))
            }
        };

        backend.register_function_counter(
            tags.meter(PRODUCE_SEQ, "Produced events counter of the store"),
            read_u64(&store, |s| s.put_sequence()),
        )?;
        backend.register_function_counter(
            tags.meter(CONSUME_SEQ, "Consumed events counter of the store"),
            read_u64(&store, |s| s.ack_sequence()),
        )?;

        let mode = store.batch_mode();
        backend.register_gauge(
            tags.meter(STORE, "Buffer size of the store")
                .tag("batchMode", mode.as_str()),
            read_u64(&store, |s| s.buffer_size()),
        )?;

        if mode.is_mem_size() {
            backend.register_function_counter(
                tags.meter(PRODUCE_MEM, "Produced bytes of the store")
                    .unit(Unit::Bytes),
                read_u64(&store, |s| s.put_mem_size()),
            )?;
            backend.register_function_counter(
                tags.meter(CONSUME_MEM, "Consumed bytes of the store")
                    .unit(Unit::Bytes),
                read_u64(&store, |s| s.ack_mem_size()),
            )?;
        }

        let delays: [(&str, &str, fn(&StoreDelays) -> u64); 3] = [
            (PUT_DELAY, "Put delay of the store in milliseconds", |d| d.put),
            (GET_DELAY, "Get delay of the store in milliseconds", |d| d.get),
            (ACK_DELAY, "Ack delay of the store in milliseconds", |d| d.ack),
        ];
        for (name, description, pick) in delays {
            backend.register_gauge(
                tags.meter(name, description).unit(Unit::Milliseconds),
                self.delay_gauge(&store, pick),
            )?;
        }

        backend.register_function_counter(
            tags.meter(PUT_ROWS, "Put table rows of the store"),
            read_u64(&store, |s| s.put_table_rows()),
        )?;
        backend.register_function_counter(
            tags.meter(GET_ROWS, "Got table rows of the store"),
            read_u64(&store, |s| s.get_table_rows()),
        )?;
        backend.register_function_counter(
            tags.meter(ACK_ROWS, "Acked table rows of the store"),
            read_u64(&store, |s| s.ack_table_rows()),
        )?;
        Ok(())
    }
}
