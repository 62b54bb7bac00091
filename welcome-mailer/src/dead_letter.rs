//! Dead-letter sinks: the audit trail for records that will never be delivered.

use crate::error::DeadLetterError;
use crate::record::{Offset, Partition, Record};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Why a record ended up in the dead-letter sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureStage {
    /// The payload was not a usable signup.
    Decode,
    /// The notifier refused the notice outright.
    Rejected,
    /// Transient failures outlasted the attempt budget.
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub topic: String,
    pub partition: Partition,
    pub offset: Offset,
    /// Payload as text; invalid UTF-8 is replaced.
    pub payload: String,
    pub stage: FailureStage,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Builds a dead letter for `record`, stamped with the current time.
    ///
    /// # Arguments
    ///
    /// * `record` - The record that could not be delivered
    /// * `stage` - Where in the pipeline it failed
    /// * `reason` - Human-readable cause
    pub fn new(record: &Record, stage: FailureStage, reason: impl Into<String>) -> Self {
        Self {
            topic: record.topic().to_string(),
            partition: record.partition(),
            offset: record.offset(),
            payload: String::from_utf8_lossy(record.payload()).into_owned(),
            stage,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Durable destination for dead letters.
///
/// `publish` must not return `Ok` before the entry is safe; the consumer
/// commits the record's offset right after.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// Logs every dead letter and optionally appends it to a JSON-lines file.
#[derive(Default)]
pub struct LogDeadLetterSink {
    journal: Option<Mutex<File>>,
}

impl LogDeadLetterSink {
    /// Creates a sink that only logs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also appends each entry to `path`, fsyncing before `publish` returns.
    pub async fn with_journal(path: impl Into<PathBuf>) -> Result<Self, DeadLetterError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!("Writing dead letters to {}", path.display());
        Ok(Self {
            journal: Some(Mutex::new(file)),
        })
    }
}

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        error!(
            topic = %letter.topic,
            partition = letter.partition,
            offset = letter.offset,
            stage = letter.stage.as_ref(),
            "Dead-lettered record: {}",
            letter.reason
        );

        if let Some(journal) = &self.journal {
            let mut line = serde_json::to_vec(letter)?;
            line.push(b'\n');
            let mut file = journal.lock().await;
            file.write_all(&line).await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}

/// Produces dead letters as JSON to a Kafka topic.
pub struct KafkaDeadLetterSink {
    inner: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterSink {
    /// Creates a producer for the dead-letter `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the producer cannot be created.
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, DeadLetterError> {
        let topic = topic.into();
        info!(
            "Creating dead-letter producer with brokers: {}, topic: {}",
            brokers, topic
        );

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()?;

        Ok(Self {
            inner: producer,
            topic,
        })
    }

    /// Dead-letter topic name for a source topic.
    pub fn topic_for(source_topic: &str) -> String {
        format!("{source_topic}.dlq")
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_vec(letter)?;
        let key = format!("{}-{}", letter.partition, letter.offset);

        debug!(
            "Sending dead letter to topic '{}' with key '{}' ({} bytes)",
            self.topic,
            key,
            payload.len()
        );

        let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);
        match self.inner.send(record, Duration::from_secs(5)).await {
            Ok((partition, offset)) => {
                debug!(
                    "Dead letter stored in topic '{}' (partition: {}, offset: {})",
                    self.topic, partition, offset
                );
                Ok(())
            }
            Err((kafka_err, _msg)) => {
                error!(
                    "Failed to send dead letter to topic '{}' with key '{}': {}",
                    self.topic, key, kafka_err
                );
                Err(DeadLetterError::Kafka(kafka_err))
            }
        }
    }
}
