use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::handler::HandlerChain;

/// Row-event sink that buffers entries before handing them downstream.
pub trait EntrySink: Send + Sync {
    fn handlers(&self) -> &HandlerChain;

    /// Total time the sink has spent blocked on the store, nanoseconds.
    fn sink_blocking_nanos(&self) -> u64;
}

#[derive(Clone)]
pub enum SinkStage {
    Entry(Arc<dyn EntrySink>),
    Other(String),
}

impl SinkStage {
    pub fn kind(&self) -> &str {
        match self {
            SinkStage::Entry(_) => "entry",
            SinkStage::Other(kind) => kind,
        }
    }
}

/// Replication log parser.
pub trait BinlogParser: Send + Sync {
    /// Total time the dump thread spent blocked publishing, nanoseconds.
    fn publish_blocking_nanos(&self) -> u64;

    fn received_binlog_bytes(&self) -> u64;

    fn is_parallel(&self) -> bool;
}

#[derive(Clone)]
pub enum ParserStage {
    Binlog(Arc<dyn BinlogParser>),
    Other(String),
}

impl ParserStage {
    pub fn kind(&self) -> &str {
        match self {
            ParserStage::Binlog(_) => "binlog",
            ParserStage::Other(kind) => kind,
        }
    }
}

/// How the buffering store accounts its capacity.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchMode {
    #[default]
    ItemSize,
    MemSize,
}

impl BatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchMode::ItemSize => "ITEMSIZE",
            BatchMode::MemSize => "MEMSIZE",
        }
    }

    pub fn is_mem_size(&self) -> bool {
        matches!(self, BatchMode::MemSize)
    }
}

/// Last put/get/ack wall-clock times of the store, epoch milliseconds.
///
/// Expected ordering is `ack <= get <= put`, but each field is read on its
/// own and concurrent updates may violate it transiently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimestamps {
    pub put: i64,
    pub get: i64,
    pub ack: i64,
}

/// In-memory ring buffer between the sink and the serving layer.
pub trait BufferedStore: Send + Sync {
    fn put_sequence(&self) -> u64;
    fn ack_sequence(&self) -> u64;
    fn buffer_size(&self) -> u64;
    fn batch_mode(&self) -> BatchMode;
    fn put_mem_size(&self) -> u64;
    fn ack_mem_size(&self) -> u64;
    fn put_exec_time(&self) -> i64;
    fn get_exec_time(&self) -> i64;
    fn ack_exec_time(&self) -> i64;
    fn put_table_rows(&self) -> u64;
    fn get_table_rows(&self) -> u64;
    fn ack_table_rows(&self) -> u64;

    fn timestamps(&self) -> StageTimestamps {
        StageTimestamps {
            put: self.put_exec_time(),
            get: self.get_exec_time(),
            ack: self.ack_exec_time(),
        }
    }
}

#[derive(Clone)]
pub enum StoreStage {
    MemoryBuffer(Arc<dyn BufferedStore>),
    Other(String),
}

impl StoreStage {
    pub fn kind(&self) -> &str {
        match self {
            StoreStage::MemoryBuffer(_) => "memory_buffer",
            StoreStage::Other(kind) => kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub destination: String,
    pub client_id: u16,
}

/// Subscription and cursor bookkeeping.
pub trait MetaManager: Send + Sync {
    /// `None` when the manager has no record of the destination.
    fn list_subscriptions(&self, destination: &str) -> Option<Vec<ClientIdentity>>;
}
