pub mod bootstrap;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod demux;
pub mod error;
pub mod forward;
pub mod kafka;
pub mod metrics_consts;
pub mod offset;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use config::{parse_consumer_specs, Config, ConfigError, ConsumerSpec, PartitionSelector};
pub use error::{BootstrapError, BootstrapStage, TailError};
pub use forward::{ForwardOutcome, RecordSink};
pub use offset::{resolve_offset, OffsetSpec};
pub use pipeline::{PipelineState, TailPipeline};
pub use types::{Message, MessageStream, Partition, OFFSET_NEWEST, OFFSET_OLDEST};
