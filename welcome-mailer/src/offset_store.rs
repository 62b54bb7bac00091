//! Durable checkpoints.

use crate::error::OffsetStoreError;
use crate::record::{Checkpoint, Offset, Partition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Where the last processed offset of every partition is kept.
///
/// `commit` must only be called once the record's side effect is done, and
/// must not return before the offset is durable.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn load(&self, partition: Partition) -> Result<Option<Offset>, OffsetStoreError>;

    async fn load_all(&self) -> Result<Checkpoint, OffsetStoreError>;

    async fn commit(&self, partition: Partition, offset: Offset) -> Result<(), OffsetStoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CommittedOffset {
    partition: Partition,
    offset: Offset,
    committed_at: DateTime<Utc>,
}

/// One small JSON file per partition.
///
/// Each commit writes a temp file, fsyncs it, renames it over the previous
/// one and fsyncs the directory. Partitions never touch each other's files,
/// so concurrent partition workers need no shared lock.
pub struct FileOffsetStore {
    dir: PathBuf,
}

impl FileOffsetStore {
    /// Opens (creating if needed) an offset directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, OffsetStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        info!("Opened offset store at {}", dir.display());
        Ok(Self { dir })
    }

    /// Directory holding the partition files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partition_path(&self, partition: Partition) -> PathBuf {
        self.dir.join(format!("partition-{partition}.json"))
    }

    async fn read_entry(path: &Path) -> Result<CommittedOffset, OffsetStoreError> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self, partition: Partition) -> Result<Option<Offset>, OffsetStoreError> {
        let path = self.partition_path(partition);
        match Self::read_entry(&path).await {
            Ok(entry) => Ok(Some(entry.offset)),
            Err(OffsetStoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn load_all(&self) -> Result<Checkpoint, OffsetStoreError> {
        let mut checkpoint = Checkpoint::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_offset_file = path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("partition-"));
            if !is_offset_file {
                continue;
            }
            let committed = Self::read_entry(&path).await?;
            checkpoint.record(committed.partition, committed.offset);
        }
        debug!("Loaded checkpoint for {} partition(s)", checkpoint.len());
        Ok(checkpoint)
    }

    #[instrument(skip(self))]
    async fn commit(&self, partition: Partition, offset: Offset) -> Result<(), OffsetStoreError> {
        let path = self.partition_path(partition);
        let tmp = path.with_extension("tmp");
        let entry = CommittedOffset {
            partition,
            offset,
            committed_at: Utc::now(),
        };

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&serde_json::to_vec(&entry)?).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;
        fs::File::open(&self.dir).await?.sync_all().await?;
        debug!("Committed offset");
        Ok(())
    }
}

/// Non-durable store for embedding and tests.
#[derive(Default)]
pub struct MemoryOffsetStore {
    checkpoint: Mutex<Checkpoint>,
}

impl MemoryOffsetStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing checkpoint.
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint: Mutex::new(checkpoint),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Checkpoint>, OffsetStoreError> {
        self.checkpoint
            .lock()
            .map_err(|_| OffsetStoreError::Unavailable("checkpoint lock poisoned".to_string()))
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self, partition: Partition) -> Result<Option<Offset>, OffsetStoreError> {
        Ok(self.lock()?.get(partition))
    }

    async fn load_all(&self) -> Result<Checkpoint, OffsetStoreError> {
        Ok(self.lock()?.clone())
    }

    async fn commit(&self, partition: Partition, offset: Offset) -> Result<(), OffsetStoreError> {
        self.lock()?.record(partition, offset);
        Ok(())
    }
}
