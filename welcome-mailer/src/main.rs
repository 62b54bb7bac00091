use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use welcome_mailer::{
    Consumer, DeadLetterSink, FileOffsetStore, JournalDedupTable, KafkaDeadLetterSink,
    KafkaSource, LogDeadLetterSink, LogTransport, Notifier, Settings,
};

#[tokio::main]
async fn main() -> Result<()> {
    set_up_tracing()?;

    let settings = Settings::from_env().context("Failed to read WELCOME_* settings")?;
    info!(
        "Consumer config - Brokers: {}, Topic: {}, State: {}",
        settings.brokers,
        settings.topic,
        settings.state_dir.display()
    );

    let source = KafkaSource::new(&settings.brokers, &settings.group_id, &settings.topic)
        .context("Failed to create Kafka source")?
        .with_max_batch(settings.max_batch);
    let offsets = FileOffsetStore::open(settings.offsets_dir())
        .await
        .context("Offset store unavailable")?;
    let dedup = JournalDedupTable::open(settings.dedup_journal(), settings.dedup_retention())
        .await
        .context("Failed to open dedup journal")?;
    let dead_letters: Arc<dyn DeadLetterSink> = match &settings.dead_letter_topic {
        Some(topic) => Arc::new(
            KafkaDeadLetterSink::new(&settings.brokers, topic.as_str())
                .context("Failed to create dead-letter producer")?,
        ),
        None => Arc::new(
            LogDeadLetterSink::with_journal(settings.dead_letter_journal())
                .await
                .context("Failed to open dead-letter journal")?,
        ),
    };

    let consumer = Consumer::new(
        Arc::new(source),
        Arc::new(offsets),
        Notifier::new(Arc::new(LogTransport), Arc::new(dedup)),
        dead_letters,
        settings.consumer_config(),
    );

    let shutdown_handle = consumer.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received shutdown signal (Ctrl+C)");
        shutdown_handle.shutdown();
    });

    info!("Starting to consume signups... Press Ctrl+C to stop");
    consumer.run().await?;

    info!("Consumer shut down gracefully");
    Ok(())
}

fn set_up_tracing() -> Result<()> {
    let fmt_layer = fmt::layer().with_target(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(if cfg!(debug_assertions) { "debug" } else { "info" }))?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    Ok(())
}
