//! Capability traits the orchestration core is written against.
//!
//! The production implementation lives in [`crate::kafka`]; tests substitute an
//! in-memory fake. Every call may block on the network, none of them retry.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::MessageStream;

/// Opens clients and consumers for one broker address set.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Client: BrokerClient;
    type Consumer: BrokerConsumer;

    async fn new_client(&self, brokers: &[String]) -> Result<Self::Client>;

    async fn new_consumer(&self, client: &Self::Client) -> Result<Self::Consumer>;
}

#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Query the oldest or newest available offset. `which` is one of the
    /// `OFFSET_OLDEST` / `OFFSET_NEWEST` sentinels.
    async fn get_offset(&self, topic: &str, partition: i32, which: i64) -> Result<i64>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync + 'static {
    type Partition: PartitionConsumer;

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<Self::Partition>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PartitionConsumer: Send + Sync + 'static {
    /// Hand out the message stream. Returns `None` once it has been taken.
    fn take_messages(&mut self) -> Option<MessageStream>;

    async fn close(&self) -> Result<()>;
}

/// Partition-consumer type produced by a connector's consumers.
pub type PartitionOf<C> = <<C as BrokerConnector>::Consumer as BrokerConsumer>::Partition;
