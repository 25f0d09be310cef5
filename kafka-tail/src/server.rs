//! HTTP surface: health checks, prometheus metrics and the `/ws` tail endpoint.
//!
//! Every websocket connection runs its own pipeline against the configured
//! consumer specs, forwarding each record as a text frame.

use std::future::ready;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broker::BrokerConnector;
use crate::config::ConsumerSpec;
use crate::forward::{ForwardOutcome, RecordSink};
use crate::metrics_consts::ACTIVE_SESSIONS;
use crate::pipeline::TailPipeline;

pub struct AppState<C: BrokerConnector> {
    pub connector: Arc<C>,
    pub specs: Arc<Vec<ConsumerSpec>>,
    pub shutdown: CancellationToken,
    pub channel_buffer: usize,
}

impl<C: BrokerConnector> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            specs: self.specs.clone(),
            shutdown: self.shutdown.clone(),
            channel_buffer: self.channel_buffer,
        }
    }
}

pub async fn index() -> &'static str {
    "kafka tail"
}

pub fn router<C: BrokerConnector>(state: AppState<C>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/ws", get(tail_websocket::<C>))
        .with_state(state)
}

async fn tail_websocket<C: BrokerConnector>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<C>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tail_session(socket, state))
}

/// Record sink writing each record as a websocket text frame.
pub struct WebSocketSink {
    sender: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl RecordSink for WebSocketSink {
    async fn send(&mut self, record: String) -> anyhow::Result<()> {
        self.sender
            .send(WsMessage::Text(record))
            .await
            .context("websocket send failed")
    }
}

async fn handle_tail_session<C: BrokerConnector>(socket: WebSocket, state: AppState<C>) {
    let (sender, mut receiver) = socket.split();
    let session = state.shutdown.child_token();

    // the client never sends data, we only watch for it going away
    let watcher = session.clone();
    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = watcher.cancelled() => break,
                frame = receiver.next() => match frame {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        info!("Client disconnected");
                        watcher.cancel();
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    });

    metrics::gauge!(ACTIVE_SESSIONS).increment(1.0);
    let mut sink = WebSocketSink { sender };
    let mut pipeline = TailPipeline::new(
        state.connector.clone(),
        state.specs.as_ref().clone(),
        session.clone(),
    )
    .with_channel_buffer(state.channel_buffer);

    match pipeline.run(&mut sink).await {
        Ok(ForwardOutcome::SinkFailed(e)) => {
            error!(error = %e, "Tail session ended on sink failure")
        }
        Ok(outcome) => info!(outcome = ?outcome, "Tail session ended"),
        Err(e) => error!(error = %e, "Tail session failed to bootstrap"),
    }
    metrics::gauge!(ACTIVE_SESSIONS).decrement(1.0);

    session.cancel();
    if let Err(e) = reader.await {
        error!(error = %e, "Websocket reader task panicked");
    }
    if let Err(e) = sink.sender.close().await {
        debug!(error = %e, "Websocket already closed");
    }
}

/// Add the prometheus `/metrics` endpoint. Installs the global recorder, so call it
/// once per process.
pub fn setup_metrics_routes(router: Router) -> anyhow::Result<Router> {
    let recorder_handle = PrometheusBuilder::new().install_recorder()?;
    Ok(router.route("/metrics", get(move || ready(recorder_handle.render()))))
}

pub async fn serve(router: Router, bind: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(bind, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::config::PartitionSelector;
    use crate::test_utils::FakeConnector;

    fn test_router() -> Router {
        router(AppState {
            connector: Arc::new(FakeConnector::builder().build()),
            specs: Arc::new(vec![ConsumerSpec::new(
                &["k1"],
                "events",
                PartitionSelector::All,
                "newest",
            )]),
            shutdown: CancellationToken::new(),
            channel_buffer: 16,
        })
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        assert_eq!(
            get_body(test_router(), "/_liveness").await,
            (StatusCode::OK, "ok".to_string())
        );
        assert_eq!(
            get_body(test_router(), "/_readiness").await,
            (StatusCode::OK, "kafka tail".to_string())
        );
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let (status, _) = get_body(test_router(), "/ws").await;

        assert!(status.is_client_error());
    }
}
