//! In-memory broker fake and recording sink for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::broker::{BrokerClient, BrokerConnector, BrokerConsumer, PartitionConsumer};
use crate::cluster::cluster_key;
use crate::forward::RecordSink;
use crate::types::{Message, MessageStream, Partition, OFFSET_NEWEST, OFFSET_OLDEST};

#[derive(Default)]
struct Script {
    partitions: HashMap<String, Vec<i32>>,
    watermarks: HashMap<(String, i32), (i64, i64)>,
    messages: HashMap<(String, i32), Vec<Message>>,
    failing_clients: HashSet<String>,
    failing_consumers: HashSet<String>,
    failing_consumer_closes: HashSet<String>,
    failing_discovery: HashSet<String>,
    panicking_consumers: HashSet<String>,
    panicking_discovery: HashSet<String>,
    failing_partition_opens: HashSet<(String, i32)>,
    failing_partition_closes: HashSet<(String, i32)>,
    finite_streams: bool,
}

#[derive(Default)]
struct FakeState {
    script: Script,
    clients_opened: AtomicUsize,
    offset_queries: AtomicUsize,
    partitions_closed: AtomicUsize,
    clients_closed: Mutex<HashMap<String, usize>>,
    consumers_closed: Mutex<HashMap<String, usize>>,
    opened: Mutex<Vec<(String, i32, i64)>>,
    close_log: Mutex<Vec<String>>,
}

#[derive(Default)]
pub struct FakeConnectorBuilder {
    script: Script,
}

impl FakeConnectorBuilder {
    pub fn with_partitions(mut self, topic: &str, partitions: &[i32]) -> Self {
        self.script
            .partitions
            .insert(topic.to_string(), partitions.to_vec());
        self
    }

    pub fn with_watermarks(
        mut self,
        topic: &str,
        partition: i32,
        oldest: i64,
        newest: i64,
    ) -> Self {
        self.script
            .watermarks
            .insert((topic.to_string(), partition), (oldest, newest));
        self
    }

    /// Messages are queued on the partition's stream as soon as it is opened.
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        for message in messages {
            self.script
                .messages
                .entry((message.topic().to_string(), message.partition()))
                .or_default()
                .push(message);
        }
        self
    }

    /// End each stream after its queued messages instead of keeping it open.
    pub fn finite_streams(mut self) -> Self {
        self.script.finite_streams = true;
        self
    }

    pub fn fail_client(mut self, brokers: &str) -> Self {
        self.script.failing_clients.insert(brokers.to_string());
        self
    }

    pub fn fail_consumer(mut self, brokers: &str) -> Self {
        self.script.failing_consumers.insert(brokers.to_string());
        self
    }

    pub fn fail_consumer_close(mut self, brokers: &str) -> Self {
        self.script.failing_consumer_closes.insert(brokers.to_string());
        self
    }

    pub fn fail_discovery(mut self, topic: &str) -> Self {
        self.script.failing_discovery.insert(topic.to_string());
        self
    }

    pub fn panic_on_consumer(mut self, brokers: &str) -> Self {
        self.script.panicking_consumers.insert(brokers.to_string());
        self
    }

    pub fn panic_on_discovery(mut self, topic: &str) -> Self {
        self.script.panicking_discovery.insert(topic.to_string());
        self
    }

    pub fn fail_partition_open(mut self, topic: &str, partition: i32) -> Self {
        self.script
            .failing_partition_opens
            .insert((topic.to_string(), partition));
        self
    }

    pub fn fail_partition_close(mut self, topic: &str, partition: i32) -> Self {
        self.script
            .failing_partition_closes
            .insert((topic.to_string(), partition));
        self
    }

    pub fn build(self) -> FakeConnector {
        FakeConnector {
            state: Arc::new(FakeState {
                script: self.script,
                ..Default::default()
            }),
        }
    }
}

pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn builder() -> FakeConnectorBuilder {
        FakeConnectorBuilder::default()
    }

    pub fn clients_opened(&self) -> usize {
        self.state.clients_opened.load(Ordering::SeqCst)
    }

    pub fn offset_queries(&self) -> usize {
        self.state.offset_queries.load(Ordering::SeqCst)
    }

    pub fn partitions_closed(&self) -> usize {
        self.state.partitions_closed.load(Ordering::SeqCst)
    }

    pub fn clients_closed(&self, brokers: &str) -> usize {
        self.state.clients_closed.lock().get(brokers).copied().unwrap_or(0)
    }

    pub fn consumers_closed(&self, brokers: &str) -> usize {
        self.state.consumers_closed.lock().get(brokers).copied().unwrap_or(0)
    }

    /// (partition, offset) pairs opened for a topic, sorted by partition.
    pub fn opened_offsets(&self, topic: &str) -> Vec<(i32, i64)> {
        let mut opened: Vec<_> = self
            .state
            .opened
            .lock()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, partition, offset)| (*partition, *offset))
            .collect();
        opened.sort_unstable();
        opened
    }

    pub fn close_log(&self) -> Vec<String> {
        self.state.close_log.lock().clone()
    }
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    type Client = FakeClient;
    type Consumer = FakeConsumer;

    async fn new_client(&self, brokers: &[String]) -> Result<FakeClient> {
        let key = cluster_key(brokers);
        if self.state.script.failing_clients.contains(&key) {
            bail!("connection refused by {key}");
        }
        self.state.clients_opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakeClient {
            key,
            state: self.state.clone(),
        })
    }

    async fn new_consumer(&self, client: &FakeClient) -> Result<FakeConsumer> {
        if self.state.script.panicking_consumers.contains(&client.key) {
            panic!("consumer factory for {} blew up", client.key);
        }
        if self.state.script.failing_consumers.contains(&client.key) {
            bail!("consumer rejected by {}", client.key);
        }
        Ok(FakeConsumer {
            key: client.key.clone(),
            state: self.state.clone(),
        })
    }
}

pub struct FakeClient {
    key: String,
    state: Arc<FakeState>,
}

#[async_trait]
impl BrokerClient for FakeClient {
    async fn get_offset(&self, topic: &str, partition: i32, which: i64) -> Result<i64> {
        self.state.offset_queries.fetch_add(1, Ordering::SeqCst);
        let (oldest, newest) = self
            .state
            .script
            .watermarks
            .get(&(topic.to_string(), partition))
            .copied()
            .ok_or_else(|| anyhow!("no offsets for {topic}:{partition}"))?;
        match which {
            OFFSET_OLDEST => Ok(oldest),
            OFFSET_NEWEST => Ok(newest),
            other => bail!("unsupported offset query {other}"),
        }
    }

    async fn close(&self) -> Result<()> {
        self.state.close_log.lock().push(format!("client {}", self.key));
        *self.state.clients_closed.lock().entry(self.key.clone()).or_default() += 1;
        Ok(())
    }
}

pub struct FakeConsumer {
    key: String,
    state: Arc<FakeState>,
}

#[async_trait]
impl BrokerConsumer for FakeConsumer {
    type Partition = FakePartitionConsumer;

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        if self.state.script.panicking_discovery.contains(topic) {
            panic!("metadata for {topic} blew up");
        }
        if self.state.script.failing_discovery.contains(topic) {
            bail!("metadata request for {topic} failed");
        }
        self.state
            .script
            .partitions
            .get(topic)
            .cloned()
            .ok_or_else(|| anyhow!("unknown topic {topic}"))
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<FakePartitionConsumer> {
        let script = &self.state.script;
        if script
            .failing_partition_opens
            .contains(&(topic.to_string(), partition))
        {
            bail!("offset {offset} out of range for {topic}:{partition}");
        }
        self.state
            .opened
            .lock()
            .push((topic.to_string(), partition, offset));

        let queued = script
            .messages
            .get(&(topic.to_string(), partition))
            .cloned()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(queued.len().max(1));
        for message in queued {
            tx.try_send(message)?;
        }
        let sender = if script.finite_streams { None } else { Some(tx) };

        Ok(FakePartitionConsumer {
            partition: Partition::new(topic, partition),
            state: self.state.clone(),
            messages: Some(rx),
            sender: Mutex::new(sender),
        })
    }

    async fn close(&self) -> Result<()> {
        self.state.close_log.lock().push(format!("consumer {}", self.key));
        *self.state.consumers_closed.lock().entry(self.key.clone()).or_default() += 1;
        if self.state.script.failing_consumer_closes.contains(&self.key) {
            bail!("consumer for {} already closed", self.key);
        }
        Ok(())
    }
}

pub struct FakePartitionConsumer {
    partition: Partition,
    state: Arc<FakeState>,
    messages: Option<MessageStream>,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
}

#[async_trait]
impl PartitionConsumer for FakePartitionConsumer {
    fn take_messages(&mut self) -> Option<MessageStream> {
        self.messages.take()
    }

    async fn close(&self) -> Result<()> {
        self.sender.lock().take();
        self.state.partitions_closed.fetch_add(1, Ordering::SeqCst);
        self.state
            .close_log
            .lock()
            .push(format!("partition {}", self.partition));
        let key = (
            self.partition.topic().to_string(),
            self.partition.partition_number(),
        );
        if self.state.script.failing_partition_closes.contains(&key) {
            bail!("failed to close partition consumer {}", self.partition);
        }
        Ok(())
    }
}

/// Sink that keeps every record, optionally failing once it holds `fail_after`.
#[derive(Default)]
pub struct RecordingSink {
    records: Vec<String>,
    fail_after: Option<usize>,
}

impl RecordingSink {
    pub fn failing_after(count: usize) -> Self {
        Self {
            records: Vec::new(),
            fail_after: Some(count),
        }
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn send(&mut self, record: String) -> Result<()> {
        if self.fail_after.is_some_and(|limit| self.records.len() >= limit) {
            bail!("connection reset by peer");
        }
        self.records.push(record);
        Ok(())
    }
}
