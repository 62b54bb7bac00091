//! Records, delivery keys and checkpoints.

use chrono::{DateTime, Utc};
use rdkafka::message::{BorrowedMessage, Message};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use welcome_messages::Signup;

pub type Partition = i32;
pub type Offset = i64;

/// One message as pulled from the source.
///
/// Records are immutable; the consumer loop owns each one until it is
/// committed, dead-lettered, or handed back to the source for redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    topic: String,
    partition: Partition,
    offset: Offset,
    payload: Vec<u8>,
    received_at: DateTime<Utc>,
}

impl Record {
    /// Creates a record received now.
    ///
    /// # Arguments
    ///
    /// * `topic` - Topic the record was read from
    /// * `partition` - Partition within the topic
    /// * `offset` - Position within the partition
    /// * `payload` - Raw message bytes
    pub fn new(
        topic: impl Into<String>,
        partition: Partition,
        offset: Offset,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Topic the record was read from.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition within the topic.
    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Position within the partition.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// Raw message bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// When the record was pulled from the source.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

impl From<&BorrowedMessage<'_>> for Record {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        Self::new(
            message.topic(),
            message.partition(),
            message.offset(),
            message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        )
    }
}

/// Identifies one logical notification across redeliveries.
///
/// A producer-supplied `idempotency_key` wins; otherwise the record's position
/// in the log is used, which is stable for as long as the log is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryKey(String);

impl DeliveryKey {
    /// Key for a decoded record: its idempotency key if it has one, else its position.
    pub fn for_record(record: &Record, signup: &Signup) -> Self {
        match signup
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
        {
            Some(key) => Self(format!("id:{key}")),
            None => Self::for_position(record.topic(), record.partition(), record.offset()),
        }
    }

    /// Key derived from a position in the log.
    pub fn for_position(topic: &str, partition: Partition, offset: Offset) -> Self {
        Self(format!("{topic}-{partition}-{offset}"))
    }

    /// The key as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last committed offset per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    committed: BTreeMap<Partition, Offset>,
}

impl Checkpoint {
    /// Creates an empty checkpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last committed offset of `partition`, if any.
    pub fn get(&self, partition: Partition) -> Option<Offset> {
        self.committed.get(&partition).copied()
    }

    /// Offset the partition resumes from, or `None` to start at the beginning.
    pub fn next_offset(&self, partition: Partition) -> Option<Offset> {
        self.get(partition).map(|offset| offset + 1)
    }

    /// Records a commit. Offsets never move backwards.
    pub fn record(&mut self, partition: Partition, offset: Offset) {
        self.committed
            .entry(partition)
            .and_modify(|current| *current = offset.max(*current))
            .or_insert(offset);
    }

    /// Number of partitions with a committed offset.
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    /// Whether no partition has a committed offset.
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Iterates over `(partition, offset)` pairs in partition order.
    pub fn iter(&self) -> impl Iterator<Item = (Partition, Offset)> + '_ {
        self.committed.iter().map(|(p, o)| (*p, *o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_key() {
        let record = Record::new("signups", 2, 41, b"{}".to_vec());
        let key = DeliveryKey::for_record(&record, &Signup::new("Ada", "ada@x.com"));
        assert_eq!(key.as_str(), "signups-2-41");
    }

    #[test]
    fn test_idempotency_key_wins() {
        let record = Record::new("signups", 0, 7, b"{}".to_vec());
        let signup = Signup::new("Ada", "ada@x.com").with_idempotency_key(" abc ");
        assert_eq!(DeliveryKey::for_record(&record, &signup).as_str(), "id:abc");

        let blank = Signup::new("Ada", "ada@x.com").with_idempotency_key("  ");
        assert_eq!(DeliveryKey::for_record(&record, &blank).as_str(), "signups-0-7");
    }

    #[test]
    fn test_checkpoint_is_monotonic() {
        let mut checkpoint = Checkpoint::new();
        assert_eq!(checkpoint.next_offset(0), None);

        checkpoint.record(0, 5);
        checkpoint.record(0, 3);
        checkpoint.record(1, 0);

        assert_eq!(checkpoint.get(0), Some(5));
        assert_eq!(checkpoint.next_offset(0), Some(6));
        assert_eq!(checkpoint.next_offset(1), Some(1));
        assert_eq!(checkpoint.len(), 2);
    }
}
