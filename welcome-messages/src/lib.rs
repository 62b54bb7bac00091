//! Message types for the welcome pipeline.
//!
//! `KafkaMessage` binds a payload type to the topic it travels on. `Signup` is
//! what arrives on the `signups` topic; `WelcomeNotice` is what the mailer hands
//! to its mail transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Subject line of every welcome notice.
pub const WELCOME_SUBJECT: &str = "Welcome to NewCompany";

/// Trait for types that are carried as Kafka messages.
///
/// Implementors name the topic their messages live on. Payloads are JSON, so
/// the trait also requires `Serialize` and `Deserialize`.
///
/// # Example
///
/// ```
/// use welcome_messages::KafkaMessage;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Unsubscribed {
///     email: String,
/// }
///
/// impl KafkaMessage for Unsubscribed {
///     const TOPIC: &'static str = "unsubscribes";
/// }
/// ```
pub trait KafkaMessage: Serialize + for<'de> Deserialize<'de> + Send + Sync {
    /// The Kafka topic messages of this type are read from or written to.
    const TOPIC: &'static str;
}

/// A new customer signup.
///
/// Only `firstname` and `email` are required. A producer may attach an
/// `idempotency_key` so that redelivered copies of the same signup are
/// recognised even when they land at a different offset. Every other field is
/// kept in `extra`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signup {
    pub firstname: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Signup {
    /// Creates a signup with no idempotency key and no extra fields.
    ///
    /// # Arguments
    ///
    /// * `firstname` - Used to greet the customer
    /// * `email` - Where the welcome notice goes
    pub fn new(firstname: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            firstname: firstname.into(),
            email: email.into(),
            idempotency_key: None,
            extra: Map::new(),
        }
    }

    /// Attaches a producer-side idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

impl KafkaMessage for Signup {
    const TOPIC: &'static str = "signups";
}

/// A rendered welcome notice, ready for the mail transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeNotice {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl WelcomeNotice {
    /// Renders the greeting for a signup.
    pub fn for_signup(signup: &Signup) -> Self {
        Self {
            to: signup.email.trim().to_string(),
            subject: WELCOME_SUBJECT.to_string(),
            body: format!(
                "Hello {}, we are so glad you joined us here at NewCompany",
                signup.firstname.trim()
            ),
        }
    }
}
