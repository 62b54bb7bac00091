//! Message sources: where records come from.

use crate::error::TransportError;
use crate::record::{Checkpoint, Offset, Partition, Record};
use async_trait::async_trait;
use rdkafka::consumer::{Consumer as RdConsumer, StreamConsumer};
use rdkafka::{ClientConfig, Offset as KafkaOffset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Default upper bound on records returned by a single poll.
pub const DEFAULT_MAX_BATCH: usize = 500;

/// How long a poll keeps collecting once it already holds a record.
const BATCH_LINGER: Duration = Duration::from_millis(20);

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// A partitioned, ordered log of records.
///
/// Delivery is at least once: anything after the last committed offset may be
/// handed out again after a restart or a [`rewind`](MessageSource::rewind).
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Positions every partition just after its checkpointed offset.
    async fn resume(&self, checkpoint: &Checkpoint) -> Result<(), TransportError>;

    /// Returns the next records, ordered by offset within each partition.
    ///
    /// Waits at most `timeout` and may return an empty batch.
    async fn poll(&self, timeout: Duration) -> Result<Vec<Record>, TransportError>;

    /// Makes `offset` the next record delivered for `partition`.
    async fn rewind(&self, partition: Partition, offset: Offset) -> Result<(), TransportError>;
}

/// Kafka-backed source.
///
/// Partitions are assigned manually from topic metadata and positioned from
/// the checkpoint, so the broker's group offsets are never consulted or
/// committed.
pub struct KafkaSource {
    inner: Arc<StreamConsumer>,
    topic: String,
    max_batch: usize,
}

impl KafkaSource {
    /// Creates a consumer for `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be created.
    pub fn new(brokers: &str, group_id: &str, topic: impl Into<String>) -> Result<Self, TransportError> {
        let topic = topic.into();
        info!(
            "Creating Kafka source with brokers: {}, group: {}, topic: {}",
            brokers, group_id, topic
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()?;

        Ok(Self {
            inner: Arc::new(consumer),
            topic,
            max_batch: DEFAULT_MAX_BATCH,
        })
    }

    /// Caps the number of records returned per poll.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn resume(&self, checkpoint: &Checkpoint) -> Result<(), TransportError> {
        let consumer = Arc::clone(&self.inner);
        let topic = self.topic.clone();
        let checkpoint = checkpoint.clone();

        // Metadata and assignment calls block on the broker.
        tokio::task::spawn_blocking(move || {
            let metadata = consumer.fetch_metadata(Some(&topic), METADATA_TIMEOUT)?;
            let partitions: Vec<Partition> = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic)
                .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                .collect();
            if partitions.is_empty() {
                return Err(TransportError::Unavailable(format!(
                    "topic '{topic}' has no partitions"
                )));
            }

            let mut assignment = TopicPartitionList::new();
            for partition in partitions {
                let position = match checkpoint.next_offset(partition) {
                    Some(offset) => KafkaOffset::Offset(offset),
                    None => KafkaOffset::Beginning,
                };
                debug!("Assigning partition {} at {:?}", partition, position);
                assignment.add_partition_offset(&topic, partition, position)?;
            }
            consumer.assign(&assignment)?;
            info!(
                "Assigned {} partition(s) of topic '{}'",
                assignment.count(),
                topic
            );
            Ok(())
        })
        .await
        .map_err(|e| TransportError::Unavailable(e.to_string()))?
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<Record>, TransportError> {
        let mut records = Vec::new();
        let mut deadline = Instant::now() + timeout;

        while records.len() < self.max_batch {
            match timeout_at(deadline, self.inner.recv()).await {
                Ok(Ok(message)) => {
                    if records.is_empty() {
                        deadline = deadline.min(Instant::now() + BATCH_LINGER);
                    }
                    records.push(Record::from(&message));
                }
                Ok(Err(e)) if records.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    // Hand back what we have; the error will surface on the next poll.
                    warn!("Error receiving message mid-batch: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(records)
    }

    async fn rewind(&self, partition: Partition, offset: Offset) -> Result<(), TransportError> {
        let consumer = Arc::clone(&self.inner);
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || {
            consumer.seek(&topic, partition, KafkaOffset::Offset(offset), SEEK_TIMEOUT)
        })
        .await
        .map_err(|e| TransportError::Unavailable(e.to_string()))??;
        debug!("Rewound partition {} to offset {}", partition, offset);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryLog {
    partitions: BTreeMap<Partition, Vec<Vec<u8>>>,
    cursors: BTreeMap<Partition, Offset>,
    failures: u32,
}

impl MemoryLog {
    fn take(&mut self, topic: &str, max_batch: usize) -> Vec<Record> {
        let mut records = Vec::new();
        for (partition, payloads) in &self.partitions {
            let cursor = self.cursors.entry(*partition).or_insert(0);
            while records.len() < max_batch {
                let Some(payload) = usize::try_from(*cursor).ok().and_then(|i| payloads.get(i)) else {
                    break;
                };
                records.push(Record::new(topic, *partition, *cursor, payload.clone()));
                *cursor += 1;
            }
        }
        records
    }
}

/// In-process partitioned log.
///
/// Useful for embedding the mailer without a broker and for tests. Supports
/// injecting transport failures into the next polls.
pub struct MemorySource {
    topic: String,
    max_batch: usize,
    log: Mutex<MemoryLog>,
    appended: Notify,
}

impl MemorySource {
    /// Creates an empty log for `topic`.
    ///
    /// # Arguments
    ///
    /// * `topic` - Topic name stamped on every record handed out
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            max_batch: DEFAULT_MAX_BATCH,
            log: Mutex::new(MemoryLog::default()),
            appended: Notify::new(),
        }
    }

    /// Caps the number of records returned per poll.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Appends a payload to `partition` and returns its offset.
    pub async fn append(&self, partition: Partition, payload: impl Into<Vec<u8>>) -> Offset {
        let offset = {
            let mut log = self.log.lock().await;
            let payloads = log.partitions.entry(partition).or_default();
            payloads.push(payload.into());
            (payloads.len() - 1) as Offset
        };
        self.appended.notify_waiters();
        offset
    }

    /// Makes the next `count` polls fail with a transport error.
    pub async fn fail_next_polls(&self, count: u32) {
        self.log.lock().await.failures = count;
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn resume(&self, checkpoint: &Checkpoint) -> Result<(), TransportError> {
        let mut log = self.log.lock().await;
        log.cursors.clear();
        for (partition, _) in checkpoint.iter() {
            if let Some(next) = checkpoint.next_offset(partition) {
                log.cursors.insert(partition, next);
            }
        }
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<Record>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let appended = self.appended.notified();
            {
                let mut log = self.log.lock().await;
                if log.failures > 0 {
                    log.failures -= 1;
                    return Err(TransportError::Unavailable("injected failure".to_string()));
                }
                let records = log.take(&self.topic, self.max_batch);
                if !records.is_empty() {
                    return Ok(records);
                }
            }
            if timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn rewind(&self, partition: Partition, offset: Offset) -> Result<(), TransportError> {
        self.log.lock().await.cursors.insert(partition, offset);
        Ok(())
    }
}
