use std::sync::Arc;

use envconfig::Envconfig;
use kafka_tail::kafka::RdKafkaConnector;
use kafka_tail::server::{self, AppState};
use kafka_tail::Config;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() -> anyhow::Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse()?),
    );
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing()?;
    info!("Starting kafka tail...");

    let config = Config::init_from_env()?;
    let specs = config.consumer_specs()?;
    info!(
        consumers = specs.len(),
        tls = config.kafka_tls,
        bind = config.bind(),
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for ctrl+c"),
        }
    });

    let state = AppState {
        connector: Arc::new(RdKafkaConnector::from_config(&config)),
        specs: Arc::new(specs),
        shutdown: shutdown.clone(),
        channel_buffer: config.channel_buffer_size,
    };
    let router = server::setup_metrics_routes(server::router(state))?;

    server::serve(router, &config.bind(), shutdown).await?;

    info!("Kafka tail shut down");
    Ok(())
}
