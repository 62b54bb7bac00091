//! Idempotent welcome-notice dispatch.

use crate::dedup::{Claim, DedupTable};
use crate::error::NotifyError;
use crate::record::DeliveryKey;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use welcome_messages::{Signup, WelcomeNotice};

/// Hands a rendered notice to whatever actually delivers mail.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, notice: &WelcomeNotice) -> Result<(), NotifyError>;
}

/// Transport that writes the notice to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(&self, notice: &WelcomeNotice) -> Result<(), NotifyError> {
        info!(
            "To:{}\nSubject: {}\n{}",
            notice.to, notice.subject, notice.body
        );
        Ok(())
    }
}

/// What a successful `notify` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The key had already been delivered; nothing was sent.
    Duplicate,
}

/// Renders signups into notices and dispatches each delivery key at most once
/// per retention window.
#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn MailTransport>,
    dedup: Arc<dyn DedupTable>,
}

impl Notifier {
    /// Creates a notifier.
    ///
    /// # Arguments
    ///
    /// * `transport` - Delivers rendered notices
    /// * `dedup` - Shared table of delivery keys
    pub fn new(transport: Arc<dyn MailTransport>, dedup: Arc<dyn DedupTable>) -> Self {
        Self { transport, dedup }
    }

    /// Sends the welcome notice for `signup` unless `key` was already delivered.
    ///
    /// # Errors
    ///
    /// `NotifyError::Permanent` for a recipient that can never be mailed or a
    /// transport rejection; `NotifyError::Transient` when a retry may help,
    /// including when another worker currently holds the same key.
    #[instrument(skip(self, signup, key), fields(key = %key))]
    pub async fn notify(&self, signup: &Signup, key: &DeliveryKey) -> Result<Delivery, NotifyError> {
        validate_recipient(&signup.email)?;

        match self
            .dedup
            .claim(key)
            .await
            .map_err(|e| NotifyError::Transient(e.to_string()))?
        {
            Claim::Delivered => {
                debug!("Already delivered, skipping");
                return Ok(Delivery::Duplicate);
            }
            Claim::InFlight => {
                return Err(NotifyError::Transient(format!(
                    "delivery of {key} is already in flight"
                )));
            }
            Claim::Acquired => {}
        }

        info!("Sending message to new customer: {}", signup.firstname.trim());
        let notice = WelcomeNotice::for_signup(signup);
        if let Err(e) = self.transport.deliver(&notice).await {
            self.dedup.release(key).await;
            return Err(e);
        }

        if let Err(e) = self.dedup.confirm(key).await {
            // The notice is out; reporting failure would only cause a resend.
            error!("Delivered but could not persist delivery key: {}", e);
        }
        Ok(Delivery::Sent)
    }

    /// Drops expired delivery keys from the dedup table.
    pub async fn purge_expired(&self) {
        match self.dedup.purge_expired().await {
            Ok(0) => debug!("No expired delivery keys"),
            Ok(count) => debug!("Purged {} delivery key(s)", count),
            Err(e) => error!("Failed to purge delivery keys: {}", e),
        }
    }
}

/// Rejects addresses no transport could ever deliver to.
pub fn validate_recipient(email: &str) -> Result<(), NotifyError> {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(NotifyError::Permanent(format!("malformed recipient '{email}'")))
    }
}
