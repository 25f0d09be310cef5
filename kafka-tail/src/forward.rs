use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::TailError;
use crate::metrics_consts::{MESSAGES_FORWARDED, SINK_ERRORS};
use crate::types::{Message, MessageStream};

/// Destination for formatted records. A send blocks the forwarding loop until it
/// completes, which backpressures the whole pipeline.
#[async_trait]
pub trait RecordSink: Send {
    async fn send(&mut self, record: String) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub enum ForwardOutcome {
    Cancelled,
    SinkFailed(TailError),
    StreamClosed,
}

#[derive(Serialize)]
struct ForwardedRecord<'a> {
    topic: &'a str,
    partition: String,
    offset: String,
    key: String,
    value: String,
    #[serde(rename = "consumedUnixTimestamp")]
    consumed_unix_timestamp: String,
}

/// Single-line JSON record, newline terminated. Key and value are decoded as
/// lossy UTF-8.
pub fn format_record(message: &Message, consumed_at: i64) -> Result<String, serde_json::Error> {
    let record = ForwardedRecord {
        topic: message.topic(),
        partition: message.partition().to_string(),
        offset: message.offset().to_string(),
        key: String::from_utf8_lossy(message.key()).into_owned(),
        value: String::from_utf8_lossy(message.value()).into_owned(),
        consumed_unix_timestamp: consumed_at.to_string(),
    };
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');
    Ok(line)
}

/// Drain the merged stream into the sink until cancelled, the stream closes, or a
/// send fails.
pub async fn run_forwarding_loop<S>(
    merged: &mut MessageStream,
    shutdown: &CancellationToken,
    sink: &mut S,
) -> ForwardOutcome
where
    S: RecordSink + ?Sized,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Received quit signal");
                return ForwardOutcome::Cancelled;
            }
            message = merged.recv() => match message {
                Some(message) => message,
                None => {
                    info!("Merged stream closed");
                    return ForwardOutcome::StreamClosed;
                }
            },
        };

        let record = match format_record(&message, chrono::Utc::now().timestamp()) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    error = %e,
                    "Failed to format message, skipping"
                );
                continue;
            }
        };

        if let Err(e) = sink.send(record).await {
            error!(error = %e, "Error while trying to send to sink");
            metrics::counter!(SINK_ERRORS).increment(1);
            return ForwardOutcome::SinkFailed(TailError::Sink(e));
        }
        metrics::counter!(MESSAGES_FORWARDED, "topic" => message.topic().to_string()).increment(1);
    }
}
