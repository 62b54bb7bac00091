//! The consumption loop.
//!
//! Every record walks the same state machine:
//!
//! ```text
//! POLLING → DECODING → NOTIFYING → COMMITTING → POLLING
//!              │          │  ↺ (transient, with backoff)
//!              └──────────┴──→ DEAD_LETTER → COMMITTING
//! ```
//!
//! An offset is committed only after its notice went out or its dead letter
//! was published. A record that cannot reach COMMITTING (dead-letter sink or
//! offset store down, or shutdown during a backoff) is deferred: the source
//! is rewound so it comes back later, and the dedup table keeps the second
//! pass from mailing twice.

use crate::dead_letter::{DeadLetter, DeadLetterSink, FailureStage};
use crate::decoder;
use crate::error::{NotifyError, Result, WelcomeError};
use crate::notifier::{Delivery, Notifier};
use crate::offset_store::OffsetStore;
use crate::record::{DeliveryKey, Partition, Record};
use crate::source::MessageSource;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};
use welcome_messages::Signup;

/// Configuration for the consumption loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Attempts per record before a transient failure is dead-lettered.
    /// Also bounds retries of dead-letter publishing and offset commits.
    pub max_attempts: u32,

    /// Initial backoff duration for retries.
    pub initial_backoff: Duration,

    /// Maximum backoff duration for retries.
    pub max_backoff: Duration,

    /// Upper bound on a single poll.
    pub poll_timeout: Duration,

    /// How often expired delivery keys are purged.
    pub purge_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(1),
            purge_interval: Duration::from_secs(3600),
        }
    }
}

impl ConsumerConfig {
    /// Creates a configuration with the default retry and polling settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt budget. Values below 1 are treated as 1.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the initial backoff duration.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Sets the maximum backoff duration.
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Sets the upper bound on a single poll.
    pub fn with_poll_timeout(mut self, duration: Duration) -> Self {
        self.poll_timeout = duration;
        self
    }

    /// Sets how often expired delivery keys are purged.
    pub fn with_purge_interval(mut self, duration: Duration) -> Self {
        self.purge_interval = duration;
        self
    }

    /// Backoff before attempt `attempt + 1`: doubles from `initial_backoff`,
    /// capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
    }
}

/// How a record left the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Notice sent and offset committed.
    Delivered,
    /// Already delivered earlier; offset committed without sending.
    Duplicate,
    /// Dead letter published and offset committed.
    DeadLettered(FailureStage),
    /// Not committed; the record will be delivered again.
    Deferred,
}

enum Stage {
    Decoding,
    Notifying {
        signup: Signup,
        key: DeliveryKey,
        attempt: u32,
    },
    DeadLetter {
        failure: FailureStage,
        reason: String,
    },
    Committing(Outcome),
}

/// At-least-once consumer that turns signups into welcome notices.
pub struct Consumer {
    source: Arc<dyn MessageSource>,
    offsets: Arc<dyn OffsetStore>,
    notifier: Notifier,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ConsumerConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Consumer {
    /// Creates a new consumer.
    ///
    /// # Arguments
    ///
    /// * `source` - Where records are polled from
    /// * `offsets` - Durable checkpoint of processed offsets
    /// * `notifier` - Sends welcome notices, deduplicated by delivery key
    /// * `dead_letters` - Destination for records that can never be delivered
    /// * `config` - Retry, backoff and polling settings
    pub fn new(
        source: Arc<dyn MessageSource>,
        offsets: Arc<dyn OffsetStore>,
        notifier: Notifier,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: ConsumerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            source,
            offsets,
            notifier,
            dead_letters,
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Runs until a shutdown is requested.
    ///
    /// # Errors
    ///
    /// Fails only if the offset store cannot be read at startup. Everything
    /// that goes wrong with a single record is handled inside the loop.
    pub async fn run(&self) -> Result<()> {
        info!("Starting consumer loop");

        let checkpoint = self.offsets.load_all().await.map_err(|e| {
            error!("Offset store unavailable at startup: {}", e);
            WelcomeError::OffsetStore(e)
        })?;
        info!("Loaded checkpoint for {} partition(s)", checkpoint.len());

        let mut attempt = 0;
        loop {
            match self.source.resume(&checkpoint).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    let backoff = self.config.backoff_for(attempt);
                    warn!(
                        "Could not position source (attempt {}): {}. Retrying in {:?}",
                        attempt, e, backoff
                    );
                    if self.sleep_unless_shutdown(backoff).await {
                        info!("Consumer stopped before consuming");
                        return Ok(());
                    }
                }
            }
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut transport_failures = 0;
        let mut last_purge = Instant::now();

        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping consumer");
                break;
            }

            if last_purge.elapsed() >= self.config.purge_interval {
                self.notifier.purge_expired().await;
                last_purge = Instant::now();
            }

            let polled = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => continue,
                polled = self.source.poll(self.config.poll_timeout) => polled,
            };

            match polled {
                Ok(records) => {
                    transport_failures = 0;
                    if !records.is_empty() {
                        self.dispatch(records).await;
                    }
                }
                Err(e) => {
                    transport_failures += 1;
                    let backoff = self.config.backoff_for(transport_failures);
                    error!("Error receiving messages: {}. Retrying in {:?}", e, backoff);
                    self.sleep_unless_shutdown(backoff).await;
                }
            }
        }

        info!("Consumer stopped");
        Ok(())
    }

    /// Splits a batch by partition and drains the partitions concurrently.
    async fn dispatch(&self, records: Vec<Record>) {
        let mut by_partition: BTreeMap<Partition, Vec<Record>> = BTreeMap::new();
        for record in records {
            by_partition.entry(record.partition()).or_default().push(record);
        }
        debug!("Dispatching batch across {} partition(s)", by_partition.len());

        join_all(
            by_partition
                .into_iter()
                .map(|(partition, records)| self.drain_partition(partition, records)),
        )
        .await;
    }

    async fn drain_partition(&self, partition: Partition, records: Vec<Record>) {
        let shutdown = self.shutdown.subscribe();
        for record in records {
            let outcome = if *shutdown.borrow() {
                Outcome::Deferred
            } else {
                self.process(&record).await
            };

            if outcome == Outcome::Deferred {
                // Everything from this record on comes back on a later poll.
                if let Err(e) = self.source.rewind(partition, record.offset()).await {
                    warn!(
                        "Could not rewind partition {} to offset {}: {}",
                        partition,
                        record.offset(),
                        e
                    );
                }
                break;
            }
        }
    }

    /// Drives one record through the state machine.
    #[instrument(skip(self, record), fields(partition = record.partition(), offset = record.offset()))]
    pub async fn process(&self, record: &Record) -> Outcome {
        let mut stage = Stage::Decoding;
        loop {
            stage = match stage {
                Stage::Decoding => match decoder::decode(record.payload()) {
                    Ok(signup) => {
                        let key = DeliveryKey::for_record(record, &signup);
                        debug!("Decoded signup, delivery key {}", key);
                        Stage::Notifying {
                            signup,
                            key,
                            attempt: 1,
                        }
                    }
                    Err(e) => Stage::DeadLetter {
                        failure: FailureStage::Decode,
                        reason: e.to_string(),
                    },
                },

                Stage::Notifying {
                    signup,
                    key,
                    attempt,
                } => match self.notifier.notify(&signup, &key).await {
                    Ok(Delivery::Sent) => Stage::Committing(Outcome::Delivered),
                    Ok(Delivery::Duplicate) => Stage::Committing(Outcome::Duplicate),
                    Err(NotifyError::Permanent(reason)) => Stage::DeadLetter {
                        failure: FailureStage::Rejected,
                        reason,
                    },
                    Err(NotifyError::Transient(reason)) if attempt >= self.config.max_attempts => {
                        error!(
                            "Failed to notify after {} attempts: {}",
                            attempt, reason
                        );
                        Stage::DeadLetter {
                            failure: FailureStage::RetriesExhausted,
                            reason,
                        }
                    }
                    Err(NotifyError::Transient(reason)) => {
                        let backoff = self.config.backoff_for(attempt);
                        warn!(
                            "Error notifying (attempt {}/{}): {}. Retrying in {:?}",
                            attempt, self.config.max_attempts, reason, backoff
                        );
                        if self.sleep_unless_shutdown(backoff).await {
                            return Outcome::Deferred;
                        }
                        Stage::Notifying {
                            signup,
                            key,
                            attempt: attempt + 1,
                        }
                    }
                },

                Stage::DeadLetter { failure, reason } => {
                    let letter = DeadLetter::new(record, failure, reason);
                    let published = self
                        .retry("publish dead letter", || self.dead_letters.publish(&letter))
                        .await;
                    if !published {
                        return Outcome::Deferred;
                    }
                    Stage::Committing(Outcome::DeadLettered(failure))
                }

                Stage::Committing(outcome) => {
                    let committed = self
                        .retry("commit offset", || {
                            self.offsets.commit(record.partition(), record.offset())
                        })
                        .await;
                    if !committed {
                        return Outcome::Deferred;
                    }
                    debug!("Record finished: {:?}", outcome);
                    return outcome;
                }
            };
        }
    }

    /// Retries `op` with backoff up to the attempt budget. Returns `false` if
    /// it never succeeded or a shutdown cut the retries short.
    async fn retry<F, Fut, E>(&self, what: &str, mut op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(()) => {
                    if attempt > 1 {
                        info!("Managed to {} after {} attempts", what, attempt);
                    }
                    return true;
                }
                Err(e) if attempt >= self.config.max_attempts => {
                    error!("Failed to {} after {} attempts: {}", what, attempt, e);
                    return false;
                }
                Err(e) => {
                    let backoff = self.config.backoff_for(attempt);
                    warn!(
                        "Failed to {} (attempt {}/{}): {}. Retrying in {:?}",
                        what, attempt, self.config.max_attempts, e, backoff
                    );
                    if self.sleep_unless_shutdown(backoff).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleeps for `duration`. Returns `true` early if a shutdown was requested.
    async fn sleep_unless_shutdown(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return true;
        }
        tokio::select! {
            _ = sleep(duration) => false,
            _ = wait_for_shutdown(&mut shutdown) => true,
        }
    }

    /// Requests a graceful shutdown of the consumer.
    ///
    /// Polling stops promptly; a record in flight finishes its current step.
    pub fn shutdown(&self) {
        info!("Requesting consumer shutdown");
        self.shutdown.send_replace(true);
    }

    /// Returns a shutdown handle that can be used to signal shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // The sender lives as long as the consumer, so an error cannot outlive it.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Handle for requesting consumer shutdown from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Requests a graceful shutdown of the consumer.
    pub fn shutdown(&self) {
        info!("Requesting consumer shutdown via handle");
        self.shutdown.send_replace(true);
    }
}
