//! Settings read from `WELCOME_*` environment variables.

use crate::consumer::ConsumerConfig;
use crate::error::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use welcome_messages::{KafkaMessage, Signup};

const ENV_PREFIX: &str = "WELCOME_";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Comma-separated list of Kafka brokers.
    #[serde(default = "default_brokers")]
    pub brokers: String,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Directory holding offsets, the dedup journal and local dead letters.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    #[serde(default = "default_dedup_retention_hours")]
    pub dedup_retention_hours: u64,

    /// When set, dead letters go to this Kafka topic instead of a local file.
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
}

fn default_brokers() -> String {
    "my-cluster-kafka-bootstrap:9092".to_string()
}

fn default_topic() -> String {
    Signup::TOPIC.to_string()
}

fn default_group_id() -> String {
    "welcome-mailer".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_max_batch() -> usize {
    500
}

fn default_dedup_retention_hours() -> u64 {
    7 * 24
}

impl Settings {
    /// Reads settings from the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Ok(envy::prefixed(ENV_PREFIX).from_env()?)
    }

    /// Reads settings from explicit key/value pairs (keys carry the `WELCOME_` prefix).
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let pairs = pairs.into_iter().map(|(k, v)| (k.into(), v.into()));
        Ok(envy::prefixed(ENV_PREFIX).from_iter(pairs)?)
    }

    /// Builds the consumption-loop configuration from these settings.
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_initial_backoff(Duration::from_millis(self.initial_backoff_ms))
            .with_max_backoff(Duration::from_millis(self.max_backoff_ms))
            .with_poll_timeout(Duration::from_millis(self.poll_timeout_ms))
    }

    /// How long delivered keys are remembered.
    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_hours.saturating_mul(3600))
    }

    /// Directory of the file offset store.
    pub fn offsets_dir(&self) -> PathBuf {
        self.state_dir.join("offsets")
    }

    /// Path of the dedup journal.
    pub fn dedup_journal(&self) -> PathBuf {
        self.state_dir.join("delivered.jsonl")
    }

    /// Path of the local dead-letter journal, used when no dead-letter topic is set.
    pub fn dead_letter_journal(&self) -> PathBuf {
        self.state_dir.join("dead-letters.jsonl")
    }
}
