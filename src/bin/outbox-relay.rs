// Copyright (c) 2025 - Cowboy AI, Inc.
//! Outbox Relay Service
//!
//! Relays the storage service's outbox table to the `STORAGE` topic and logs
//! every `storage.file.uploaded` event it sees come back.
//!
//! Configuration is read from `APP_*` environment variables, see
//! [`ocr_pipeline::AppConfig`].

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::TracerProvider;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ocr_pipeline::events::storage::STORAGE_CHANNEL;
use ocr_pipeline::events::{Event, FileUploaded, Payload};
use ocr_pipeline::outbox::{PgChangeFeed, PgOutboxStore};
use ocr_pipeline::{
    AppConfig, ConsumerSettings, EventConsumer, EventProducer, EventRegistry, FnEventHandler,
    NatsClient, OutboxProcessor, TopicSettings,
};

fn init_tracing(log_level: &str) -> TracerProvider {
    let provider = TracerProvider::builder().build();
    let tracer = provider.tracer("outbox-relay");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    provider
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let provider = init_tracing(&config.log_level);

    info!("🚀 Starting outbox relay");
    info!(
        nats = ?config.nats.servers,
        table = %config.outbox.table,
        channel = %config.outbox.notify_channel,
        "Configuration loaded"
    );

    let nats = NatsClient::connect(&config.nats).await?;
    let jetstream = nats.jetstream();

    let producer = Arc::new(EventProducer::new(
        "storage_producer",
        jetstream.clone(),
        TopicSettings::new(STORAGE_CHANNEL).with_description("Storage service events"),
    ));
    producer
        .ensure_topic()
        .await
        .context("Failed to ensure storage topic")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .connect(&config.postgres.uri)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let store = PgOutboxStore::new(pool.clone(), config.outbox.table.clone())?;
    store.ensure_schema().await?;

    let feed = PgChangeFeed::new(pool.clone(), config.outbox.notify_channel.clone());
    let processor = OutboxProcessor::new(
        "storage",
        Arc::new(store),
        EventRegistry::storage(),
        producer.clone(),
        config.outbox.clone(),
    )
    .with_change_feed(Arc::new(feed));

    let consumer = EventConsumer::for_payload(
        jetstream,
        ConsumerSettings::new(
            "outbox_relay_file_uploaded_consumer",
            STORAGE_CHANNEL,
            FileUploaded::KIND,
        )
        .with_description("Logs uploaded files"),
        Arc::new(FnEventHandler::new(|event: Event<FileUploaded>| async move {
            let file = event.payload();
            info!(
                event.id = %event.id(),
                file_key = %file.file_key,
                file_name = %file.file_name,
                bucket = %file.bucket_name,
                "📨 File uploaded"
            );
            Ok::<_, anyhow::Error>(())
        })),
    );
    consumer.subscribe().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = tokio::spawn(async move { processor.start(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    consumer.stop().await;
    shutdown_tx.send_replace(true);

    match relay.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Outbox processor failed"),
        Err(e) => error!(error = %e, "Outbox processor task panicked"),
    }

    nats.flush().await;
    pool.close().await;

    if let Err(e) = provider.shutdown() {
        eprintln!("failed to shut down tracer provider: {e}");
    }

    info!("👋 Outbox relay stopped");
    Ok(())
}
