//! Error types for the welcome mailer.
//!
//! Each component gets its own error enum so that the consumer loop can tell
//! a bad record apart from a bad transport or a bad disk.

use thiserror::Error;

/// Result type alias for loop-level operations.
pub type Result<T> = std::result::Result<T, WelcomeError>;

/// Errors that stop the mailer or fail its construction.
#[derive(Error, Debug)]
pub enum WelcomeError {
    /// The message source could not be reached.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The offset store could not be read or written.
    #[error("Offset store error: {0}")]
    OffsetStore(#[from] OffsetStoreError),

    /// The dedup table could not be opened.
    #[error("Dedup table error: {0}")]
    Dedup(#[from] DedupError),

    /// The dead-letter sink could not be opened.
    #[error("Dead-letter error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    /// Settings could not be read from the environment.
    #[error("Configuration error: {0}")]
    Config(#[from] envy::Error),
}

/// Failure talking to the message source. Retried with backoff by the loop.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// A payload that is not a usable signup. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty payload")]
    Empty,

    #[error("Payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Field '{0}' must be a string")]
    NotAString(&'static str),
}

/// Delivery failure, classified by whether a retry can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// Downstream unavailable or busy; retry with backoff.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// The notice can never be delivered (e.g. malformed recipient).
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

#[derive(Error, Debug)]
pub enum OffsetStoreError {
    #[error("Offset store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Offset store entry is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Offset store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Dedup journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dedup journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("Dead-letter journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dead-letter serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dead-letter topic error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}
