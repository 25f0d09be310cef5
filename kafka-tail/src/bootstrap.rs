//! Opens every configured partition consumer against an already connected registry.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, info};

use crate::broker::{BrokerConnector, BrokerConsumer, PartitionConsumer};
use crate::cluster::BrokerCluster;
use crate::config::{ConsumerSpec, PartitionSelector};
use crate::error::{BootstrapError, BootstrapStage, TailError};
use crate::offset::resolve_offset;
use crate::registry::{report_errors, ClusterRegistry};
use crate::types::MessageStream;

/// What one spec worker produced: the streams it opened and the errors it hit.
#[derive(Default)]
struct SpecOutcome {
    streams: Vec<MessageStream>,
    errors: Vec<TailError>,
}

/// For every spec concurrently: discover partitions, resolve offsets, open and
/// register partition consumers.
///
/// On success the registry is handed back with the message streams, in no
/// particular order. On any failure every cluster is closed and the collected
/// errors are returned.
pub async fn open_partition_consumers<C: BrokerConnector>(
    specs: &[ConsumerSpec],
    registry: ClusterRegistry<C>,
) -> Result<(ClusterRegistry<C>, Vec<MessageStream>), BootstrapError> {
    let handles: Vec<_> = specs
        .iter()
        .map(|spec| {
            let cluster = registry.get(&spec.brokers).cloned();
            tokio::spawn(guarded_open_spec(spec.clone(), cluster))
        })
        .collect();

    let mut streams = Vec::new();
    let mut errors = Vec::new();
    for joined in join_all(handles).await {
        match joined {
            Ok(outcome) => {
                streams.extend(outcome.streams);
                errors.extend(outcome.errors);
            }
            Err(e) => errors.push(TailError::Worker(e.to_string())),
        }
    }

    if !errors.is_empty() {
        report_errors(BootstrapStage::PartitionConsumers, &errors);
        drop(streams);
        registry.close_all().await;
        return Err(BootstrapError::new(BootstrapStage::PartitionConsumers, errors));
    }

    info!(
        partition_consumers = streams.len(),
        "Successfully finished setting up partition consumers, ready to consume"
    );
    Ok((registry, streams))
}

/// Partition consumers registered before a panic stay with their cluster and are
/// closed with it; the panic itself becomes an error.
async fn guarded_open_spec<C: BrokerConnector>(
    spec: ConsumerSpec,
    cluster: Option<Arc<BrokerCluster<C>>>,
) -> SpecOutcome {
    let context = format!("opening partitions of {} on [{}]", spec.topic, spec.brokers.join(","));
    match AssertUnwindSafe(open_spec(spec, cluster)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => SpecOutcome {
            streams: Vec::new(),
            errors: vec![TailError::from_panic(&context, panic)],
        },
    }
}

async fn open_spec<C: BrokerConnector>(
    spec: ConsumerSpec,
    cluster: Option<Arc<BrokerCluster<C>>>,
) -> SpecOutcome {
    let mut outcome = SpecOutcome::default();
    let brokers = spec.brokers.join(",");

    let Some(cluster) = cluster else {
        outcome.errors.push(TailError::Connection {
            brokers,
            resource: "cluster",
            source: anyhow::anyhow!("no cluster registered for these brokers"),
        });
        return outcome;
    };
    let Some(connection) = cluster.connection() else {
        outcome.errors.push(TailError::Connection {
            brokers,
            resource: "cluster",
            source: anyhow::anyhow!("cluster is not connected"),
        });
        return outcome;
    };

    let partitions = match spec.partition {
        PartitionSelector::All => match connection.consumer.partitions(&spec.topic).await {
            Ok(partitions) => partitions,
            Err(source) => {
                outcome.errors.push(TailError::Discovery {
                    brokers,
                    topic: spec.topic.clone(),
                    source,
                });
                return outcome;
            }
        },
        PartitionSelector::Single(partition) => vec![partition],
    };

    for partition in partitions.iter().copied() {
        let offset =
            match resolve_offset(&spec.offset, &spec.topic, partition, &connection.client).await {
                Ok(offset) => offset,
                Err(source) => {
                    outcome.errors.push(TailError::OffsetResolution {
                        brokers: brokers.clone(),
                        topic: spec.topic.clone(),
                        partition,
                        source,
                    });
                    continue;
                }
            };

        let mut partition_consumer = match connection
            .consumer
            .consume_partition(&spec.topic, partition, offset)
            .await
        {
            Ok(pc) => pc,
            Err(source) => {
                outcome.errors.push(TailError::PartitionOpen {
                    brokers: brokers.clone(),
                    topic: spec.topic.clone(),
                    partition,
                    offset,
                    source,
                });
                continue;
            }
        };

        let messages = partition_consumer.take_messages();
        // registered even without a stream so teardown still closes it
        cluster.register(partition_consumer);
        match messages {
            Some(messages) => {
                debug!(topic = %spec.topic, partition, offset, "Opened partition consumer");
                outcome.streams.push(messages);
            }
            None => outcome.errors.push(TailError::PartitionOpen {
                brokers: brokers.clone(),
                topic: spec.topic.clone(),
                partition,
                offset,
                source: anyhow::anyhow!("partition consumer has no message stream"),
            }),
        }
    }

    info!(
        topic = %spec.topic,
        brokers = %brokers,
        count = outcome.streams.len(),
        "Added partition consumer(s) for topic"
    );
    outcome
}
