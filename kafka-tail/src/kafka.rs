//! rdkafka-backed implementation of the broker capabilities.
//!
//! A client is a group-less `BaseConsumer` used for metadata and watermark queries.
//! The consumer is one `StreamConsumer` per cluster. Each partition consumer adds
//! its partition to that consumer's assignment and splits off the partition queue,
//! with a pump task copying messages into a bounded channel.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{BaseConsumer, Consumer, DefaultConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message as _};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, BrokerConnector, BrokerConsumer, PartitionConsumer};
use crate::config::Config;
use crate::metrics_consts::RECEIVE_ERRORS;
use crate::types::{Message, MessageStream, Partition, OFFSET_NEWEST, OFFSET_OLDEST};

const RECEIVE_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const RECEIVE_BACKOFF_MAX: Duration = Duration::from_secs(10);

type PartitionQueue = StreamPartitionQueue<DefaultConsumerContext>;

#[derive(Debug, Clone)]
pub struct RdKafkaConnector {
    tls: bool,
    timeout: Duration,
    channel_buffer: usize,
}

impl RdKafkaConnector {
    pub fn new(tls: bool, timeout: Duration, channel_buffer: usize) -> Self {
        Self {
            tls,
            timeout,
            channel_buffer: channel_buffer.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.kafka_tls,
            config.kafka_client_timeout(),
            config.channel_buffer_size,
        )
    }

    fn client_config(&self, brokers: &[String]) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", brokers.join(","))
            .set("socket.timeout.ms", self.timeout.as_millis().to_string());

        if self.tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }
}

#[async_trait]
impl BrokerConnector for RdKafkaConnector {
    type Client = RdKafkaClient;
    type Consumer = RdKafkaConsumer;

    async fn new_client(&self, brokers: &[String]) -> Result<RdKafkaClient> {
        let config = self.client_config(brokers);
        let base: BaseConsumer = config.create().context("failed to create kafka client")?;
        let client = RdKafkaClient::from_base(brokers, config, self.timeout, base);

        // fail fast on unreachable brokers instead of on first use
        let probe = client.handle()?;
        let timeout = self.timeout;
        let fetched = tokio::task::spawn_blocking(move || probe.fetch_metadata(None, timeout))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r.context("failed to fetch cluster metadata"));
        if let Err(e) = fetched {
            if let Err(close_err) = client.close().await {
                warn!(error = %close_err, "Error closing unverified client");
            }
            return Err(e);
        }

        info!(brokers = %client.brokers, "Connected kafka client");
        Ok(client)
    }

    async fn new_consumer(&self, client: &RdKafkaClient) -> Result<RdKafkaConsumer> {
        let consumer: StreamConsumer = client
            .config
            .clone()
            .set("group.id", format!("kafka-tail-{}", Uuid::now_v7()))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .context("failed to create kafka consumer")?;

        Ok(RdKafkaConsumer::from_stream_consumer(
            client.brokers.clone(),
            consumer,
            self.timeout,
            self.channel_buffer,
        ))
    }
}

pub struct RdKafkaClient {
    brokers: String,
    config: ClientConfig,
    timeout: Duration,
    base: Mutex<Option<Arc<BaseConsumer>>>,
}

impl RdKafkaClient {
    fn from_base(
        brokers: &[String],
        config: ClientConfig,
        timeout: Duration,
        base: BaseConsumer,
    ) -> Self {
        Self {
            brokers: brokers.join(","),
            config,
            timeout,
            base: Mutex::new(Some(Arc::new(base))),
        }
    }

    /// Borrow the handle for one call. Nothing outside the client keeps it past that.
    fn handle(&self) -> Result<Arc<BaseConsumer>> {
        self.base
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("client for [{}] is closed", self.brokers))
    }
}

#[async_trait]
impl BrokerClient for RdKafkaClient {
    async fn get_offset(&self, topic: &str, partition: i32, which: i64) -> Result<i64> {
        let base = self.handle()?;
        let (low, high) = fetch_watermarks(base, topic, partition, self.timeout).await?;
        match which {
            OFFSET_OLDEST => Ok(low),
            OFFSET_NEWEST => Ok(high),
            other => bail!("unsupported offset query {other}"),
        }
    }

    async fn close(&self) -> Result<()> {
        let base = self.base.lock().take();
        match base {
            Some(base) => release(base).await,
            None => bail!("client for [{}] already closed", self.brokers),
        }
    }
}

pub struct RdKafkaConsumer {
    brokers: String,
    timeout: Duration,
    channel_buffer: usize,
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
    events: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl RdKafkaConsumer {
    fn from_stream_consumer(
        brokers: String,
        consumer: StreamConsumer,
        timeout: Duration,
        channel_buffer: usize,
    ) -> Self {
        let consumer = Arc::new(consumer);
        let events = CancellationToken::new();
        let event_loop = tokio::spawn(serve_events(
            consumer.clone(),
            brokers.clone(),
            events.clone(),
        ));
        Self {
            brokers,
            timeout,
            channel_buffer,
            consumer: Mutex::new(Some(consumer)),
            events,
            event_loop: Mutex::new(Some(event_loop)),
        }
    }

    fn handle(&self) -> Result<Arc<StreamConsumer>> {
        self.consumer
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("consumer for [{}] is closed", self.brokers))
    }
}

#[async_trait]
impl BrokerConsumer for RdKafkaConsumer {
    type Partition = RdKafkaPartitionConsumer;

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let consumer = self.handle()?;
        let owned_topic = topic.to_string();
        let timeout = self.timeout;
        let metadata = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(Some(&owned_topic), timeout)
        })
        .await??;

        let found = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| anyhow!("topic {topic} not found"))?;
        if let Some(err) = found.error() {
            bail!("metadata error for topic {topic}: {err:?}");
        }

        let mut partitions: Vec<i32> = found.partitions().iter().map(|p| p.id()).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<RdKafkaPartitionConsumer> {
        let consumer = self.handle()?;

        // librdkafka would silently reset an out-of-range start, so reject it here
        if offset >= 0 {
            let (low, high) =
                fetch_watermarks(consumer.clone(), topic, partition, self.timeout).await?;
            if offset < low || offset > high {
                bail!("offset {offset} out of range [{low}, {high}]");
            }
        }

        // incremental so the queues already split for other partitions stay valid
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, to_rdkafka_offset(offset))?;
        consumer.incremental_assign(&tpl)?;

        let Some(queue) = consumer.split_partition_queue(topic, partition) else {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(topic, partition);
            if let Err(e) = consumer.incremental_unassign(&tpl) {
                warn!(topic, partition, error = %e, "Failed to unassign partition");
            }
            bail!("no partition queue for {topic}:{partition}");
        };

        let (tx, rx) = mpsc::channel(self.channel_buffer);
        let shutdown = CancellationToken::new();
        let target = Partition::new(topic, partition);
        let pump = tokio::spawn(pump_partition(queue, target.clone(), tx, shutdown.clone()));

        Ok(RdKafkaPartitionConsumer {
            partition: target,
            consumer: Arc::downgrade(&consumer),
            messages: Some(rx),
            shutdown,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Stops serving events, drops the assignment and destroys the consumer. Partition
    /// consumers must be closed first, their queues keep the consumer alive.
    async fn close(&self) -> Result<()> {
        let consumer = self.consumer.lock().take();
        let Some(consumer) = consumer else {
            bail!("consumer for [{}] already closed", self.brokers);
        };

        self.events.cancel();
        let event_loop = self.event_loop.lock().take();
        if let Some(event_loop) = event_loop {
            if let Err(e) = event_loop.await {
                warn!(brokers = %self.brokers, error = %e, "Consumer event loop panicked");
            }
        }

        let unassigned = consumer.unassign();
        release(consumer).await?;
        unassigned.context("failed to drop consumer assignment")
    }
}

pub struct RdKafkaPartitionConsumer {
    partition: Partition,
    consumer: Weak<StreamConsumer>,
    messages: Option<MessageStream>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl PartitionConsumer for RdKafkaPartitionConsumer {
    fn take_messages(&mut self) -> Option<MessageStream> {
        self.messages.take()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let pump = self.pump.lock().take();
        let Some(pump) = pump else {
            bail!("partition consumer {} already closed", self.partition);
        };
        pump.await
            .with_context(|| format!("partition consumer {} panicked", self.partition))?;

        if let Some(consumer) = self.consumer.upgrade() {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(self.partition.topic(), self.partition.partition_number());
            consumer
                .incremental_unassign(&tpl)
                .with_context(|| format!("failed to unassign {}", self.partition))?;
        }
        Ok(())
    }
}

/// Dropping a librdkafka handle can block while it leaves its group.
async fn release<T: Send + Sync + 'static>(handle: Arc<T>) -> Result<()> {
    tokio::task::spawn_blocking(move || drop(handle)).await?;
    Ok(())
}

/// The main queue still has to be polled for librdkafka to serve events. With every
/// partition split off it should not see messages.
async fn serve_events(
    consumer: Arc<StreamConsumer>,
    brokers: String,
    shutdown: CancellationToken,
) {
    let mut backoff = RECEIVE_BACKOFF_INITIAL;
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = consumer.recv() => {
                received.map(|m| Partition::new(m.topic(), m.partition()))
            }
        };

        match received {
            Ok(partition) => {
                warn!(brokers = %brokers, partition = %partition, "Stray message, skipping");
                backoff = RECEIVE_BACKOFF_INITIAL;
            }
            Err(e) => {
                warn!(brokers = %brokers, error = %e, "Kafka consumer error");
                if !sleep_or_cancelled(&shutdown, &mut backoff).await {
                    break;
                }
            }
        }
    }
    debug!(brokers = %brokers, "Consumer event loop stopped");
}

async fn pump_partition(
    queue: PartitionQueue,
    partition: Partition,
    tx: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    debug!(partition = %partition, "Starting partition pump");
    let mut backoff = RECEIVE_BACKOFF_INITIAL;
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = queue.recv() => received.map(|m| owned_message(&m)),
        };

        let message = match received {
            Ok(message) => {
                backoff = RECEIVE_BACKOFF_INITIAL;
                message
            }
            Err(e) if ends_stream(&e) => {
                error!(partition = %partition, error = %e, "Partition unreadable, ending stream");
                metrics::counter!(RECEIVE_ERRORS, "topic" => partition.topic().to_string())
                    .increment(1);
                break;
            }
            Err(e) => {
                warn!(partition = %partition, error = %e, retry_in = ?backoff, "Receive error");
                metrics::counter!(RECEIVE_ERRORS, "topic" => partition.topic().to_string())
                    .increment(1);
                if !sleep_or_cancelled(&shutdown, &mut backoff).await {
                    break;
                }
                continue;
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = tx.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(partition = %partition, "Partition pump stopped");
}

/// Sleep for the current backoff and double it. Returns false if cancelled first.
async fn sleep_or_cancelled(shutdown: &CancellationToken, backoff: &mut Duration) -> bool {
    let delay = *backoff;
    *backoff = next_backoff(delay);
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(RECEIVE_BACKOFF_MAX)
}

/// Errors after which the partition will not produce messages again.
fn ends_stream(error: &KafkaError) -> bool {
    if matches!(error, KafkaError::MessageConsumptionFatal(_)) {
        return true;
    }
    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::UnknownPartition
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::Fatal
        )
    )
}

async fn fetch_watermarks<K>(
    consumer: Arc<K>,
    topic: &str,
    partition: i32,
    timeout: Duration,
) -> Result<(i64, i64)>
where
    K: Consumer + Send + Sync + 'static,
{
    let topic = topic.to_string();
    let watermarks =
        tokio::task::spawn_blocking(move || consumer.fetch_watermarks(&topic, partition, timeout))
            .await??;
    Ok(watermarks)
}

fn owned_message(message: &BorrowedMessage<'_>) -> Message {
    Message::new(
        message.topic(),
        message.partition(),
        message.offset(),
        message.key().unwrap_or_default(),
        message.payload().unwrap_or_default(),
    )
}

pub fn to_rdkafka_offset(offset: i64) -> Offset {
    match offset {
        OFFSET_OLDEST => Offset::Beginning,
        OFFSET_NEWEST => Offset::End,
        n => Offset::Offset(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // nothing listens here, creating handles never connects
    const UNREACHABLE: &str = "127.0.0.1:1";

    fn unreachable_client(connector: &RdKafkaConnector) -> (RdKafkaClient, Weak<BaseConsumer>) {
        let brokers = vec![UNREACHABLE.to_string()];
        let config = connector.client_config(&brokers);
        let base: BaseConsumer = config.create().unwrap();
        let client = RdKafkaClient::from_base(&brokers, config, connector.timeout, base);
        let weak = Arc::downgrade(&client.handle().unwrap());
        (client, weak)
    }

    #[test]
    fn test_sentinels_map_to_logical_offsets() {
        assert_eq!(to_rdkafka_offset(OFFSET_OLDEST), Offset::Beginning);
        assert_eq!(to_rdkafka_offset(OFFSET_NEWEST), Offset::End);
        assert_eq!(to_rdkafka_offset(0), Offset::Offset(0));
        assert_eq!(to_rdkafka_offset(1234), Offset::Offset(1234));
    }

    #[test]
    fn test_client_config() {
        let connector = RdKafkaConnector::new(true, Duration::from_secs(5), 0);
        let config = connector.client_config(&["k1:9092".to_string(), "k2:9092".to_string()]);

        assert_eq!(config.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("socket.timeout.ms"), Some("5000"));
        assert_eq!(connector.channel_buffer, 1);
    }

    #[test]
    fn test_plaintext_by_default() {
        let connector = RdKafkaConnector::new(false, Duration::from_secs(5), 16);
        let config = connector.client_config(&["k1:9092".to_string()]);

        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let mut backoff = RECEIVE_BACKOFF_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(backoff);
            backoff = next_backoff(backoff);
        }

        assert_eq!(seen[1], Duration::from_millis(200));
        assert_eq!(seen[2], Duration::from_millis(400));
        assert_eq!(*seen.last().unwrap(), RECEIVE_BACKOFF_MAX);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_missing_topic_ends_stream_transient_errors_do_not() {
        assert!(ends_stream(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition
        )));
        assert!(ends_stream(&KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
        assert!(!ends_stream(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
        assert!(!ends_stream(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::AllBrokersDown
        )));
    }

    #[tokio::test]
    async fn test_close_releases_librdkafka_handles() {
        let connector = RdKafkaConnector::new(false, Duration::from_secs(1), 16);
        let (client, client_handle) = unreachable_client(&connector);
        let consumer = connector.new_consumer(&client).await.unwrap();
        let consumer_handle = Arc::downgrade(&consumer.handle().unwrap());

        // the consumer owns its own connection, not a share of the client's
        assert_eq!(client_handle.strong_count(), 1);

        consumer.close().await.unwrap();
        assert_eq!(consumer_handle.strong_count(), 0);
        assert_eq!(client_handle.strong_count(), 1);

        client.close().await.unwrap();
        assert_eq!(client_handle.strong_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_handles_reject_further_use() {
        let connector = RdKafkaConnector::new(false, Duration::from_secs(1), 16);
        let (client, _) = unreachable_client(&connector);
        let consumer = connector.new_consumer(&client).await.unwrap();

        consumer.close().await.unwrap();
        client.close().await.unwrap();

        assert!(consumer.close().await.is_err());
        assert!(consumer.partitions("events").await.is_err());
        assert!(consumer.consume_partition("events", 0, OFFSET_NEWEST).await.is_err());
        assert!(client.close().await.is_err());
        assert!(client.get_offset("events", 0, OFFSET_OLDEST).await.is_err());
    }
}
