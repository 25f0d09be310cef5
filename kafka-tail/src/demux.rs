//! Fan-in of per-partition message streams into one stream.
//!
//! One worker per input stream. Ordering within an input is preserved, ordering
//! across inputs is whatever the scheduler produces. The merged stream closes once
//! every worker has exited, since each worker owns one of its senders.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{Message, MessageStream};

/// Handles to the running fan-in workers.
pub struct Demultiplexer {
    workers: Vec<JoinHandle<()>>,
}

impl Demultiplexer {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit. Workers exit on cancellation, when their input
    /// ends, or when the merged stream is dropped.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Demultiplexer worker panicked");
            }
        }
    }
}

pub fn demux_messages(
    streams: Vec<MessageStream>,
    shutdown: CancellationToken,
    buffer: usize,
) -> (MessageStream, Demultiplexer) {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    let workers = streams
        .into_iter()
        .map(|input| tokio::spawn(forward_stream(input, tx.clone(), shutdown.clone())))
        .collect();

    (rx, Demultiplexer { workers })
}

async fn forward_stream(
    mut input: MessageStream,
    output: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = input.recv() => match message {
                Some(message) => message,
                None => {
                    debug!("Input stream ended");
                    break;
                }
            },
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = output.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}
