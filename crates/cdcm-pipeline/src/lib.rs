//! Capability surface of a change-data-capture pipeline instance.
//!
//! The instrumentation core never reaches into a pipeline's internals. It
//! sees each stage through one of the tagged variants in [`stage`] and reads
//! individually-atomic accessors from the capability trait behind it. Stages
//! that are not of the expected kind surface as `Other(kind)` so that probes
//! can reject them with a typed error instead of inspecting runtime types.

pub mod event;
pub mod handler;
pub mod instance;
pub mod stage;
#[cfg(any(test, feature = "test_support"))]
pub mod test_support;

pub use event::{EntryType, RowEvent};
pub use handler::{DownstreamHandler, HandlerChain};
pub use instance::{InstanceMode, PipelineInstance};
pub use stage::{
    BatchMode, BinlogParser, BufferedStore, ClientIdentity, EntrySink, MetaManager, ParserStage,
    SinkStage, StageTimestamps, StoreStage,
};
