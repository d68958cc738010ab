use serde::{Deserialize, Serialize};

/// Kind of a parsed replication log entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    TransactionBegin,
    RowData,
    TransactionEnd,
    Heartbeat,
    Gtid,
}

/// One row-level event as it flows from the sink stage into the store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowEvent {
    /// Source execute time, epoch milliseconds.
    pub execute_time: i64,
    pub entry_type: EntryType,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
}

impl RowEvent {
    pub fn new(entry_type: EntryType, execute_time: i64) -> Self {
        Self {
            execute_time,
            entry_type,
            schema: None,
            table: None,
        }
    }

    pub fn with_table(mut self, schema: &str, table: &str) -> Self {
        self.schema = Some(schema.to_string());
        self.table = Some(table.to_string());
        self
    }
}
