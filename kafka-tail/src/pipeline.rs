//! End-to-end orchestration: bootstrap, fan-in, forward, teardown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bootstrap::open_partition_consumers;
use crate::broker::BrokerConnector;
use crate::config::ConsumerSpec;
use crate::demux::demux_messages;
use crate::error::BootstrapError;
use crate::forward::{run_forwarding_loop, ForwardOutcome, RecordSink};
use crate::registry::ClusterRegistry;

pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    BootstrappingClusters,
    BootstrappingPartitions,
    Forwarding,
    Cancelled,
    SinkFailed,
    StreamClosed,
    Failed,
}

pub struct TailPipeline<C: BrokerConnector> {
    connector: Arc<C>,
    specs: Vec<ConsumerSpec>,
    shutdown: CancellationToken,
    channel_buffer: usize,
    state: PipelineState,
}

impl<C: BrokerConnector> TailPipeline<C> {
    /// `shutdown` stops forwarding from the outside. The pipeline only ever cancels
    /// a child of it, so sibling pipelines sharing the token are unaffected.
    pub fn new(connector: Arc<C>, specs: Vec<ConsumerSpec>, shutdown: CancellationToken) -> Self {
        Self {
            connector,
            specs,
            shutdown,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            state: PipelineState::Idle,
        }
    }

    pub fn with_channel_buffer(mut self, channel_buffer: usize) -> Self {
        self.channel_buffer = channel_buffer;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        info!(from = ?self.state, to = ?next, "Pipeline state change");
        self.state = next;
    }

    /// Run until cancelled, the sink fails, or every partition stream ends.
    ///
    /// Whatever ends forwarding, the fan-in workers are joined and every cluster
    /// is closed before this returns. A bootstrap failure returns the aggregated
    /// errors with nothing left open.
    pub async fn run<S>(&mut self, sink: &mut S) -> Result<ForwardOutcome, BootstrapError>
    where
        S: RecordSink + ?Sized,
    {
        self.transition(PipelineState::BootstrappingClusters);
        let registry = match ClusterRegistry::build(self.connector.clone(), &self.specs).await {
            Ok(registry) => registry,
            Err(e) => {
                self.transition(PipelineState::Failed);
                return Err(e);
            }
        };

        self.transition(PipelineState::BootstrappingPartitions);
        let (registry, streams) = match open_partition_consumers(&self.specs, registry).await {
            Ok(opened) => opened,
            Err(e) => {
                self.transition(PipelineState::Failed);
                return Err(e);
            }
        };

        let token = self.shutdown.child_token();
        let (mut merged, demux) = demux_messages(streams, token.clone(), self.channel_buffer);
        info!(workers = demux.worker_count(), "Forwarding messages");
        self.transition(PipelineState::Forwarding);

        let outcome = run_forwarding_loop(&mut merged, &token, sink).await;
        self.transition(match &outcome {
            ForwardOutcome::Cancelled => PipelineState::Cancelled,
            ForwardOutcome::SinkFailed(_) => PipelineState::SinkFailed,
            ForwardOutcome::StreamClosed => PipelineState::StreamClosed,
        });

        token.cancel();
        demux.join().await;
        drop(merged);

        let close_errors = registry.close_all().await;
        if !close_errors.is_empty() {
            warn!(count = close_errors.len(), "Errors while closing clusters");
        }
        info!("Pipeline shut down");

        Ok(outcome)
    }
}
