//! At-least-once welcome mailer.
//!
//! Consumes signups from a partitioned Kafka topic and sends every new
//! customer a welcome notice, built on top of `rdkafka` and `tokio`.
//!
//! # Features
//!
//! - Explicit per-record state machine: decode, notify, commit, or dead-letter
//! - Offsets checkpointed only after the side effect is done
//! - Idempotent dispatch keyed by [`DeliveryKey`], surviving restarts via a journal
//! - Bounded retries with exponential backoff for transient failures
//! - Dead-letter audit trail for records that can never be delivered
//! - Graceful shutdown support
//! - Integrated tracing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use welcome_mailer::{
//!     Consumer, ConsumerConfig, FileOffsetStore, JournalDedupTable, KafkaSource,
//!     LogDeadLetterSink, LogTransport, Notifier, DEFAULT_RETENTION,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = KafkaSource::new("localhost:9092", "welcome-mailer", "signups")?;
//!     let offsets = FileOffsetStore::open("./state/offsets").await?;
//!     let dedup = JournalDedupTable::open("./state/delivered.jsonl", DEFAULT_RETENTION).await?;
//!     let notifier = Notifier::new(Arc::new(LogTransport), Arc::new(dedup));
//!
//!     let consumer = Consumer::new(
//!         Arc::new(source),
//!         Arc::new(offsets),
//!         notifier,
//!         Arc::new(LogDeadLetterSink::new()),
//!         ConsumerConfig::new(),
//!     );
//!     consumer.run().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod consumer;
mod dead_letter;
mod decoder;
mod dedup;
mod error;
mod notifier;
mod offset_store;
mod record;
mod source;

pub use config::Settings;
pub use consumer::{Consumer, ConsumerConfig, Outcome, ShutdownHandle};
pub use dead_letter::{DeadLetter, DeadLetterSink, FailureStage, KafkaDeadLetterSink, LogDeadLetterSink};
pub use decoder::{decode, REQUIRED_FIELDS};
pub use dedup::{Claim, DedupTable, JournalDedupTable, DEFAULT_RETENTION};
pub use error::{
    DeadLetterError, DecodeError, DedupError, NotifyError, OffsetStoreError, Result,
    TransportError, WelcomeError,
};
pub use notifier::{validate_recipient, Delivery, LogTransport, MailTransport, Notifier};
pub use offset_store::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
pub use record::{Checkpoint, DeliveryKey, Offset, Partition, Record};
pub use source::{KafkaSource, MemorySource, MessageSource, DEFAULT_MAX_BATCH};

/// Re-export the message types for convenience
pub use welcome_messages::{KafkaMessage, Signup, WelcomeNotice, WELCOME_SUBJECT};
