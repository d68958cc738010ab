//! In-memory fake stages for exercising probes without a live pipeline.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handler::HandlerChain;
use crate::instance::{InstanceMode, PipelineInstance};
use crate::stage::{
    BatchMode, BinlogParser, BufferedStore, ClientIdentity, EntrySink, MetaManager, ParserStage,
    SinkStage, StoreStage,
};

#[derive(Default)]
pub struct FakeSink {
    pub chain: HandlerChain,
    pub blocking_nanos: AtomicU64,
}

impl EntrySink for FakeSink {
    fn handlers(&self) -> &HandlerChain {
        &self.chain
    }

    fn sink_blocking_nanos(&self) -> u64 {
        self.blocking_nanos.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct FakeParser {
    pub blocking_nanos: AtomicU64,
    pub received_bytes: AtomicU64,
    pub parallel: AtomicBool,
}

impl BinlogParser for FakeParser {
    fn publish_blocking_nanos(&self) -> u64 {
        self.blocking_nanos.load(Ordering::Relaxed)
    }

    fn received_binlog_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    fn is_parallel(&self) -> bool {
        self.parallel.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct FakeStore {
    pub put_seq: AtomicU64,
    pub ack_seq: AtomicU64,
    pub buffer_size: AtomicU64,
    pub mem_mode: AtomicBool,
    pub put_mem: AtomicU64,
    pub ack_mem: AtomicU64,
    pub put_time: AtomicI64,
    pub get_time: AtomicI64,
    pub ack_time: AtomicI64,
    pub put_rows: AtomicU64,
    pub get_rows: AtomicU64,
    pub ack_rows: AtomicU64,
}

impl FakeStore {
    pub fn set_times(&self, put: i64, get: i64, ack: i64) {
        self.put_time.store(put, Ordering::Relaxed);
        self.get_time.store(get, Ordering::Relaxed);
        self.ack_time.store(ack, Ordering::Relaxed);
    }
}

impl BufferedStore for FakeStore {
    fn put_sequence(&self) -> u64 {
        self.put_seq.load(Ordering::Relaxed)
    }

    fn ack_sequence(&self) -> u64 {
        self.ack_seq.load(Ordering::Relaxed)
    }

    fn buffer_size(&self) -> u64 {
        self.buffer_size.load(Ordering::Relaxed)
    }

    fn batch_mode(&self) -> BatchMode {
        if self.mem_mode.load(Ordering::Relaxed) {
            BatchMode::MemSize
        } else {
            BatchMode::ItemSize
        }
    }

    fn put_mem_size(&self) -> u64 {
        self.put_mem.load(Ordering::Relaxed)
    }

    fn ack_mem_size(&self) -> u64 {
        self.ack_mem.load(Ordering::Relaxed)
    }

    fn put_exec_time(&self) -> i64 {
        self.put_time.load(Ordering::Relaxed)
    }

    fn get_exec_time(&self) -> i64 {
        self.get_time.load(Ordering::Relaxed)
    }

    fn ack_exec_time(&self) -> i64 {
        self.ack_time.load(Ordering::Relaxed)
    }

    fn put_table_rows(&self) -> u64 {
        self.put_rows.load(Ordering::Relaxed)
    }

    fn get_table_rows(&self) -> u64 {
        self.get_rows.load(Ordering::Relaxed)
    }

    fn ack_table_rows(&self) -> u64 {
        self.ack_rows.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct FakeMeta {
    pub subscriptions: Mutex<Option<Vec<ClientIdentity>>>,
}

impl FakeMeta {
    pub fn subscribe(&self, destination: &str, client_id: u16) {
        self.subscriptions
            .lock()
            .get_or_insert_with(Vec::new)
            .push(ClientIdentity {
                destination: destination.to_string(),
                client_id,
            });
    }
}

impl MetaManager for FakeMeta {
    fn list_subscriptions(&self, destination: &str) -> Option<Vec<ClientIdentity>> {
        self.subscriptions.lock().as_ref().map(|subs| {
            subs.iter()
                .filter(|c| c.destination == destination)
                .cloned()
                .collect()
        })
    }
}

/// A fully wired instance whose stages can be swapped per test.
pub struct FakeInstance {
    pub destination: String,
    pub mode: InstanceMode,
    pub sink_impl: Arc<FakeSink>,
    pub parser_impl: Arc<FakeParser>,
    pub store_impl: Arc<FakeStore>,
    pub meta_impl: Arc<FakeMeta>,
    pub sink_override: Option<String>,
    pub parser_override: Option<String>,
    pub store_override: Option<String>,
    pub without_meta: bool,
}

impl FakeInstance {
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            mode: InstanceMode::Manager,
            sink_impl: Arc::new(FakeSink::default()),
            parser_impl: Arc::new(FakeParser::default()),
            store_impl: Arc::new(FakeStore::default()),
            meta_impl: Arc::new(FakeMeta::default()),
            sink_override: None,
            parser_override: None,
            store_override: None,
            without_meta: false,
        }
    }

    pub fn with_sink_kind(mut self, kind: &str) -> Self {
        self.sink_override = Some(kind.to_string());
        self
    }

    pub fn with_parser_kind(mut self, kind: &str) -> Self {
        self.parser_override = Some(kind.to_string());
        self
    }

    pub fn with_store_kind(mut self, kind: &str) -> Self {
        self.store_override = Some(kind.to_string());
        self
    }

    pub fn without_meta(mut self) -> Self {
        self.without_meta = true;
        self
    }
}

impl PipelineInstance for FakeInstance {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn mode(&self) -> InstanceMode {
        self.mode
    }

    fn sink(&self) -> SinkStage {
        match &self.sink_override {
            Some(kind) => SinkStage::Other(kind.clone()),
            None => SinkStage::Entry(self.sink_impl.clone()),
        }
    }

    fn parser(&self) -> ParserStage {
        match &self.parser_override {
            Some(kind) => ParserStage::Other(kind.clone()),
            None => ParserStage::Binlog(self.parser_impl.clone()),
        }
    }

    fn store(&self) -> StoreStage {
        match &self.store_override {
            Some(kind) => StoreStage::Other(kind.clone()),
            None => StoreStage::MemoryBuffer(self.store_impl.clone()),
        }
    }

    fn meta_manager(&self) -> Option<Arc<dyn MetaManager>> {
        if self.without_meta {
            None
        } else {
            Some(self.meta_impl.clone())
        }
    }
}
