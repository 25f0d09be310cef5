//! Builds one connected [`BrokerCluster`] per distinct broker set, all-or-nothing.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, BrokerConnector};
use crate::cluster::{cluster_key, BrokerCluster, ClusterConnection};
use crate::config::ConsumerSpec;
use crate::error::{BootstrapError, BootstrapStage, TailError};
use crate::metrics_consts::BOOTSTRAP_FAILURES;

pub struct ClusterRegistry<C: BrokerConnector> {
    clusters: HashMap<String, Arc<BrokerCluster<C>>>,
}

impl<C: BrokerConnector> ClusterRegistry<C> {
    /// One empty cluster per distinct broker list. Lists that differ only in order
    /// are distinct clusters.
    pub fn distinct_clusters(specs: &[ConsumerSpec]) -> HashMap<String, BrokerCluster<C>> {
        let mut clusters = HashMap::new();
        for spec in specs {
            clusters
                .entry(cluster_key(&spec.brokers))
                .or_insert_with(|| BrokerCluster::new(spec.brokers.clone()));
        }
        clusters
    }

    /// Open a client and consumer for every distinct cluster concurrently.
    ///
    /// If any open fails, every error is logged, every cluster that did connect is
    /// closed, and the aggregated errors are returned.
    pub async fn build(connector: Arc<C>, specs: &[ConsumerSpec]) -> Result<Self, BootstrapError> {
        let pending = Self::distinct_clusters(specs);
        info!(clusters = pending.len(), "Setting up clusters");

        let handles: Vec<_> = pending
            .into_values()
            .map(|cluster| tokio::spawn(open_cluster(connector.clone(), cluster)))
            .collect();

        let mut clusters = HashMap::new();
        let mut errors = Vec::new();
        for joined in join_all(handles).await {
            match joined {
                Ok((cluster, None)) => {
                    clusters.insert(cluster.key().to_string(), Arc::new(cluster));
                }
                Ok((cluster, Some(e))) => {
                    errors.push(e);
                    clusters.insert(cluster.key().to_string(), Arc::new(cluster));
                }
                Err(e) => errors.push(TailError::Worker(e.to_string())),
            }
        }

        let registry = Self { clusters };
        if errors.is_empty() {
            return Ok(registry);
        }

        report_errors(BootstrapStage::Clusters, &errors);
        registry.close_all().await;
        Err(BootstrapError::new(BootstrapStage::Clusters, errors))
    }

    pub fn get(&self, brokers: &[String]) -> Option<&Arc<BrokerCluster<C>>> {
        self.clusters.get(&cluster_key(brokers))
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Arc<BrokerCluster<C>>> {
        self.clusters.values()
    }

    /// Close every cluster. Consuming the registry guarantees each cluster is
    /// closed exactly once.
    pub async fn close_all(self) -> Vec<TailError> {
        info!(clusters = self.clusters.len(), "Trying to close all clusters");
        let mut errors = Vec::new();
        for cluster in self.clusters.values() {
            errors.extend(cluster.close().await);
        }
        info!(errors = errors.len(), "Finished trying to close all clusters");
        errors
    }
}

/// Always hands the cluster back, even if connecting panicked, so it still reaches
/// `close_all`.
async fn open_cluster<C: BrokerConnector>(
    connector: Arc<C>,
    mut cluster: BrokerCluster<C>,
) -> (BrokerCluster<C>, Option<TailError>) {
    info!(brokers = %cluster.key(), "Adding client+consumer for cluster");

    let connected = AssertUnwindSafe(connect(connector.as_ref(), &mut cluster))
        .catch_unwind()
        .await;
    let error = match connected {
        Ok(error) => error,
        Err(panic) => {
            let context = format!("opening cluster [{}]", cluster.key());
            Some(TailError::from_panic(&context, panic))
        }
    };
    (cluster, error)
}

async fn connect<C: BrokerConnector>(
    connector: &C,
    cluster: &mut BrokerCluster<C>,
) -> Option<TailError> {
    let client = match connector.new_client(cluster.brokers()).await {
        Ok(client) => client,
        Err(source) => {
            return Some(TailError::Connection {
                brokers: cluster.key().to_string(),
                resource: "client",
                source,
            });
        }
    };

    match connector.new_consumer(&client).await {
        Ok(consumer) => {
            cluster.set_connection(ClusterConnection { client, consumer });
            None
        }
        Err(source) => {
            // the cluster never holds a client without a consumer, so release it here
            if let Err(close_err) = client.close().await {
                warn!(brokers = %cluster.key(), error = %close_err, "Error closing orphan client");
            }
            Some(TailError::Connection {
                brokers: cluster.key().to_string(),
                resource: "consumer",
                source,
            })
        }
    }
}

pub(crate) fn report_errors(stage: BootstrapStage, errors: &[TailError]) {
    error!(count = errors.len(), "{} error(s) during {}", errors.len(), stage);
    for (i, e) in errors.iter().enumerate() {
        error!(kind = e.kind(), "Error #{}: {}", i, e);
        metrics::counter!(BOOTSTRAP_FAILURES, "kind" => e.kind()).increment(1);
    }
}
