mod amqp;

use amqp::{AmqpChannelAcknowledger, AmqpEventsPublisher, AmqpSessionBridge};
use clap::Parser;
use dataplant_core::bridge::Acknowledger;
use dataplant_core::{AmqpDataConsumer, DeviceRegistry, TriggersHandler};
use dataplant_models::constants::DEFAULT_CONFIG_FILE_NAME;
use dataplant_models::settings::Settings;
use dataplant_storage::{DataStore, MemoryStore};
use lapin::{Connection, ConnectionProperties};
use std::env::current_dir;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Data updater plant: consumes device telemetry from the broker,
/// validates it against per-realm interface schemas, persists it, and
/// dispatches trigger events.
#[derive(Parser)]
#[command(name = "dataplant")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Data updater plant", long_about = None)]
struct Cli {
    /// Configuration file path; defaults to `dataplant.toml` in the
    /// working directory.
    #[arg(short, long, env = "DUP_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => current_dir()?.join(DEFAULT_CONFIG_FILE_NAME),
    };
    let settings = Settings::new(&config_path.to_string_lossy())?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&settings.general.log_filter)?)
        .init();

    info!(url = %settings.amqp.url, "connecting to broker");
    let conn = Connection::connect(&settings.amqp.url, ConnectionProperties::default()).await?;

    let events_channel = conn.create_channel().await?;
    let publisher = Arc::new(
        AmqpEventsPublisher::new(events_channel.clone(), settings.amqp.events_exchange.clone())
            .await?,
    );
    let session = Arc::new(AmqpSessionBridge::new(
        events_channel,
        settings.amqp.session_rpc_routing_key.clone(),
    ));

    // The wide-column driver plugs in behind `DataStore`; the embedded
    // store keeps single-node deployments self-contained.
    let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());

    let registry = Arc::new(DeviceRegistry::new(
        store,
        TriggersHandler::new(publisher),
        session,
        settings.updater.mailbox_capacity,
    ));

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();
    for n in 0..settings.amqp.data_queue_count {
        let queue = format!("{}{}", settings.amqp.data_queue_prefix, n);
        let (channel, deliveries) =
            amqp::consume_queue(&conn, &queue, settings.amqp.prefetch_count).await?;
        let acknowledger: Arc<dyn Acknowledger> = Arc::new(AmqpChannelAcknowledger::new(channel));
        let consumer = AmqpDataConsumer::new(
            queue.clone(),
            deliveries,
            acknowledger,
            registry.clone(),
            shutdown.clone(),
        );
        workers.push(tokio::spawn(async move {
            if let Err(e) = consumer.run().await {
                error!(queue = %queue, error = %e, "consumer worker failed");
            }
        }));
    }
    info!(workers = workers.len(), "data updater plant running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}
