use parking_lot::Mutex;
use tracing::{info, warn};

use crate::broker::{BrokerClient, BrokerConnector, BrokerConsumer, PartitionConsumer, PartitionOf};
use crate::error::TailError;
use crate::metrics_consts::{CLOSE_ERRORS, OPEN_PARTITION_CONSUMERS};

/// Identity of a cluster: its broker addresses joined in configured order.
pub fn cluster_key(brokers: &[String]) -> String {
    brokers.join(",")
}

/// The client and consumer of a connected cluster. They are only ever set together.
pub struct ClusterConnection<C: BrokerConnector> {
    pub client: C::Client,
    pub consumer: C::Consumer,
}

/// One broker cluster and everything opened against it.
pub struct BrokerCluster<C: BrokerConnector> {
    brokers: Vec<String>,
    key: String,
    connection: Option<ClusterConnection<C>>,
    partition_consumers: Mutex<Vec<PartitionOf<C>>>,
}

impl<C: BrokerConnector> BrokerCluster<C> {
    pub fn new(brokers: Vec<String>) -> Self {
        let key = cluster_key(&brokers);
        Self {
            brokers,
            key,
            connection: None,
            partition_consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn connection(&self) -> Option<&ClusterConnection<C>> {
        self.connection.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn set_connection(&mut self, connection: ClusterConnection<C>) {
        self.connection = Some(connection);
    }

    /// Take ownership of an opened partition consumer. The lock is only held for the push.
    pub fn register(&self, partition_consumer: PartitionOf<C>) {
        self.partition_consumers.lock().push(partition_consumer);
        metrics::gauge!(OPEN_PARTITION_CONSUMERS).increment(1.0);
    }

    pub fn partition_consumer_count(&self) -> usize {
        self.partition_consumers.lock().len()
    }

    /// Close every partition consumer, then the consumer, then the client.
    /// Each close is attempted even if an earlier one failed; failures are logged
    /// and returned.
    pub async fn close(&self) -> Vec<TailError> {
        info!(brokers = %self.key, "Trying to close cluster");
        let mut errors = Vec::new();

        let partition_consumers = std::mem::take(&mut *self.partition_consumers.lock());
        info!(
            brokers = %self.key,
            count = partition_consumers.len(),
            "Trying to close partition consumers"
        );
        for partition_consumer in &partition_consumers {
            if let Err(source) = partition_consumer.close().await {
                errors.push(self.close_error("partition consumer", source));
            }
        }
        metrics::gauge!(OPEN_PARTITION_CONSUMERS).decrement(partition_consumers.len() as f64);

        if let Some(connection) = &self.connection {
            match connection.consumer.close().await {
                Ok(()) => info!(brokers = %self.key, "Successfully closed consumer"),
                Err(source) => errors.push(self.close_error("consumer", source)),
            }

            match connection.client.close().await {
                Ok(()) => info!(brokers = %self.key, "Successfully closed client"),
                Err(source) => errors.push(self.close_error("client", source)),
            }
        }

        info!(brokers = %self.key, errors = errors.len(), "Finished trying to close cluster");
        errors
    }

    fn close_error(&self, resource: &'static str, source: anyhow::Error) -> TailError {
        let error = TailError::Close {
            brokers: self.key.clone(),
            resource,
            source,
        };
        warn!(error = %error, "Error while closing cluster resource");
        metrics::counter!(CLOSE_ERRORS, "resource" => resource).increment(1);
        error
    }
}
