//! Delivery-key dedup table.

use crate::error::DedupError;
use crate::record::DeliveryKey;
use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Default time a delivered key is remembered.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Result of trying to claim a delivery key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the key and must `confirm` or `release` it.
    Acquired,
    /// The key was already delivered; do nothing.
    Delivered,
    /// Another worker is delivering this key right now.
    InFlight,
}

/// Shared table of delivery keys.
///
/// `claim` is an atomic check-then-set per key, so two workers racing on the
/// same key never both get `Claim::Acquired`.
#[async_trait]
pub trait DedupTable: Send + Sync {
    async fn claim(&self, key: &DeliveryKey) -> Result<Claim, DedupError>;

    async fn confirm(&self, key: &DeliveryKey) -> Result<(), DedupError>;

    async fn release(&self, key: &DeliveryKey);

    /// Forgets delivered keys older than the retention. Returns how many were dropped.
    async fn purge_expired(&self) -> Result<usize, DedupError>;
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    InFlight,
    Delivered(DateTime<Utc>),
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalLine {
    key: DeliveryKey,
    delivered_at: DateTime<Utc>,
}

struct Journal {
    path: PathBuf,
    file: File,
}

/// In-memory dedup table with an optional append-only journal.
///
/// With a journal, delivered keys are fsynced as JSON lines and reloaded on
/// open, so a restarted process still recognises what it already sent.
pub struct JournalDedupTable {
    entries: Mutex<AHashMap<DeliveryKey, Entry>>,
    journal: Option<AsyncMutex<Journal>>,
    retention: chrono::Duration,
}

impl JournalDedupTable {
    /// A table that forgets everything on restart.
    pub fn in_memory(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(AHashMap::new()),
            journal: None,
            retention: to_chrono(retention),
        }
    }

    /// Opens a journaled table, replaying unexpired keys from `path`.
    ///
    /// A journal left with a torn tail or expired keys is rewritten from the
    /// keys that loaded cleanly before anything new is appended.
    ///
    /// # Arguments
    ///
    /// * `path` - Journal file, created along with its directory if missing
    /// * `retention` - How long a delivered key is remembered
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read, created or rewritten.
    pub async fn open(path: impl Into<PathBuf>, retention: Duration) -> Result<Self, DedupError> {
        let path = path.into();
        let retention = to_chrono(retention);
        let cutoff = Utc::now() - retention;

        let mut entries = AHashMap::new();
        let mut needs_rewrite = false;
        match fs::read(&path).await {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                needs_rewrite = !contents.is_empty() && !contents.ends_with('\n');
                for (number, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JournalLine>(line) {
                        Ok(entry) if entry.delivered_at >= cutoff => {
                            entries.insert(entry.key, Entry::Delivered(entry.delivered_at));
                        }
                        Ok(_) => needs_rewrite = true,
                        Err(e) => {
                            warn!(
                                "Skipping unreadable dedup journal line {} in {}: {}",
                                number + 1,
                                path.display(),
                                e
                            );
                            needs_rewrite = true;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = open_append(&path).await?;
        info!(
            "Opened dedup journal at {} with {} remembered key(s)",
            path.display(),
            entries.len()
        );

        let table = Self {
            entries: Mutex::new(entries),
            journal: Some(AsyncMutex::new(Journal { path, file })),
            retention,
        };
        if needs_rewrite {
            if let Some(journal) = &table.journal {
                let mut journal = journal.lock().await;
                table.rewrite_journal(&mut journal).await?;
                info!("Rewrote dedup journal at {}", journal.path.display());
            }
        }
        Ok(table)
    }

    /// Number of keys currently remembered as delivered.
    pub fn delivered_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| matches!(entry, Entry::Delivered(_)))
            .count()
    }

    // The map is never left half-updated, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, AHashMap<DeliveryKey, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(&self, delivered_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        delivered_at < now - self.retention
    }

    async fn rewrite_journal(&self, journal: &mut Journal) -> Result<(), DedupError> {
        let mut contents = Vec::new();
        let delivered: Vec<_> = self
            .lock()
            .iter()
            .filter_map(|(key, entry)| match entry {
                Entry::Delivered(at) => Some(JournalLine {
                    key: key.clone(),
                    delivered_at: *at,
                }),
                Entry::InFlight => None,
            })
            .collect();
        for line in &delivered {
            serde_json::to_writer(&mut contents, line)?;
            contents.push(b'\n');
        }

        let tmp = journal.path.with_extension("compact");
        let mut file = File::create(&tmp).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &journal.path).await?;
        journal.file = open_append(&journal.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DedupTable for JournalDedupTable {
    async fn claim(&self, key: &DeliveryKey) -> Result<Claim, DedupError> {
        let now = Utc::now();
        let mut entries = self.lock();
        let claim = match entries.get(key) {
            Some(Entry::Delivered(at)) if !self.is_expired(*at, now) => Claim::Delivered,
            Some(Entry::InFlight) => Claim::InFlight,
            _ => {
                entries.insert(key.clone(), Entry::InFlight);
                Claim::Acquired
            }
        };
        debug!("Claim on {}: {:?}", key, claim);
        Ok(claim)
    }

    async fn confirm(&self, key: &DeliveryKey) -> Result<(), DedupError> {
        let delivered_at = Utc::now();
        self.lock().insert(key.clone(), Entry::Delivered(delivered_at));

        if let Some(journal) = &self.journal {
            let mut line = serde_json::to_vec(&JournalLine {
                key: key.clone(),
                delivered_at,
            })?;
            line.push(b'\n');
            let mut journal = journal.lock().await;
            journal.file.write_all(&line).await?;
            journal.file.sync_data().await?;
        }
        Ok(())
    }

    async fn release(&self, key: &DeliveryKey) {
        let mut entries = self.lock();
        if matches!(entries.get(key), Some(Entry::InFlight)) {
            entries.remove(key);
        }
    }

    async fn purge_expired(&self) -> Result<usize, DedupError> {
        let now = Utc::now();
        let purged = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|_, entry| match entry {
                Entry::Delivered(at) => !self.is_expired(*at, now),
                Entry::InFlight => true,
            });
            before - entries.len()
        };

        if purged > 0 {
            if let Some(journal) = &self.journal {
                let mut journal = journal.lock().await;
                self.rewrite_journal(&mut journal).await?;
            }
            info!("Purged {} expired delivery key(s)", purged);
        }
        Ok(purged)
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Retention is capped at a century so `now - retention` stays in range.
fn to_chrono(retention: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(retention).map_or(cap, |r| r.min(cap))
}
