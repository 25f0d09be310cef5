use std::any::Any;
use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OffsetError {
    #[error("invalid value for consumer offset: {0:?}")]
    InvalidOffsetSpecifier(String),

    #[error("failed to query {which} offset: {source}")]
    Broker {
        which: &'static str,
        source: anyhow::Error,
    },
}

#[derive(Error, Debug)]
pub enum TailError {
    #[error("error creating {resource} for cluster [{brokers}]: {source}")]
    Connection {
        brokers: String,
        resource: &'static str,
        source: anyhow::Error,
    },

    #[error("error fetching partitions for topic {topic} on [{brokers}]: {source}")]
    Discovery {
        brokers: String,
        topic: String,
        source: anyhow::Error,
    },

    #[error("could not resolve offset for [{brokers}] {topic}:{partition}: {source}")]
    OffsetResolution {
        brokers: String,
        topic: String,
        partition: i32,
        #[source]
        source: OffsetError,
    },

    #[error("failed to consume {topic}:{partition} at offset {offset} on [{brokers}]: {source}")]
    PartitionOpen {
        brokers: String,
        topic: String,
        partition: i32,
        offset: i64,
        source: anyhow::Error,
    },

    #[error("error while sending to sink: {0}")]
    Sink(#[source] anyhow::Error),

    #[error("error closing {resource} for cluster [{brokers}]: {source}")]
    Close {
        brokers: String,
        resource: &'static str,
        source: anyhow::Error,
    },

    #[error("bootstrap worker failed: {0}")]
    Worker(String),
}

impl TailError {
    /// Tag used for metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            TailError::Connection { .. } => "connection",
            TailError::Discovery { .. } => "discovery",
            TailError::OffsetResolution { .. } => "offset_resolution",
            TailError::PartitionOpen { .. } => "partition_open",
            TailError::Sink(_) => "sink",
            TailError::Close { .. } => "close",
            TailError::Worker(_) => "worker",
        }
    }

    pub(crate) fn from_panic(context: &str, payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        TailError::Worker(format!("{context} panicked: {message}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStage {
    Clusters,
    PartitionConsumers,
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapStage::Clusters => write!(f, "cluster bootstrap"),
            BootstrapStage::PartitionConsumers => write!(f, "partition consumer bootstrap"),
        }
    }
}

/// Every failure collected during one bootstrap stage. By the time this is
/// returned, everything the stage opened has already been closed.
#[derive(Error, Debug)]
#[error("{stage} failed with {count} error(s)", count = .errors.len())]
pub struct BootstrapError {
    pub stage: BootstrapStage,
    pub errors: Vec<TailError>,
}

impl BootstrapError {
    pub fn new(stage: BootstrapStage, errors: Vec<TailError>) -> Self {
        Self { stage, errors }
    }
}
