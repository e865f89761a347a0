//! Durable checkpoints: the highest offset per partition below which everything is done.
//!
//! Stores are monotonic and idempotent: persisting an offset at or below the stored one is a
//! no-op. Writes go through a per partition [CheckpointWriter] so the tracker never waits on
//! storage; the writer only ever holds the newest offset, retries with backoff, and raises
//! [HealthIssue::CheckpointDegraded] while storage keeps failing. Ingestion goes on meanwhile,
//! bounded by the flow control credits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use backoff::retry::Retry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::Result;
use crate::config::RetryConfig;
use crate::health::{HealthIssue, HealthReporter};
use crate::message::PartitionId;
use crate::metrics::{partition_labels, pipeline_metrics};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durably records `offset` unless an equal or higher offset is already stored.
    async fn persist(&self, partition: PartitionId, offset: u64) -> Result<()>;

    /// Stored offset of the partition, read once at startup.
    async fn load(&self, partition: PartitionId) -> Result<Option<u64>>;
}

/// Checkpoints kept in process memory. Survives pipeline restarts within one process, which is
/// what the tests and the demo binary need.
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpointStore {
    offsets: Arc<Mutex<HashMap<PartitionId, u64>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: PartitionId) -> Option<u64> {
        self.offsets.lock().get(&partition).copied()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn persist(&self, partition: PartitionId, offset: u64) -> Result<()> {
        let mut offsets = self.offsets.lock();
        let stored = offsets.entry(partition).or_insert(offset);
        if offset > *stored {
            *stored = offset;
        }
        Ok(())
    }

    async fn load(&self, partition: PartitionId) -> Result<Option<u64>> {
        Ok(self.get(partition))
    }
}

/// On-disk form of a checkpoint.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct CheckpointDocument {
    partition: PartitionId,
    offset: u64,
    updated_at: DateTime<Utc>,
}

/// One JSON document per partition in a directory. Documents are written to a temporary file
/// and renamed into place, so a crash leaves either the old or the new checkpoint.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    // serializes read-compare-write cycles.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::CheckpointWrite(format!("creating {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path_of(&self, partition: PartitionId) -> PathBuf {
        self.dir.join(format!("partition-{partition}.json"))
    }

    /// Makes the rename itself durable.
    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<()> {
        let dir = tokio::fs::File::open(&self.dir).await.map_err(|e| {
            Error::CheckpointWrite(format!("opening {}: {e}", self.dir.display()))
        })?;
        dir.sync_all()
            .await
            .map_err(|e| Error::CheckpointWrite(format!("syncing {}: {e}", self.dir.display())))
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) -> Result<()> {
        Ok(())
    }

    async fn read_document(path: &Path) -> Result<Option<CheckpointDocument>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                Error::CheckpointWrite(format!("corrupt checkpoint {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::CheckpointWrite(format!(
                "reading {}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn persist(&self, partition: PartitionId, offset: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_of(partition);
        if let Some(stored) = Self::read_document(&path).await?
            && stored.offset >= offset
        {
            return Ok(());
        }

        let document = CheckpointDocument {
            partition,
            offset,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| Error::CheckpointWrite(format!("encoding checkpoint: {e}")))?;

        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::CheckpointWrite(format!("creating {}: {e}", tmp.display())))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Error::CheckpointWrite(format!("writing {}: {e}", tmp.display())))?;
        file.sync_all()
            .await
            .map_err(|e| Error::CheckpointWrite(format!("syncing {}: {e}", tmp.display())))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::CheckpointWrite(format!("renaming {}: {e}", tmp.display())))?;
        self.sync_dir().await
    }

    async fn load(&self, partition: PartitionId) -> Result<Option<u64>> {
        let document = Self::read_document(&self.path_of(partition)).await?;
        Ok(document.map(|d| d.offset))
    }
}

/// Handle to the background task persisting the checkpoints of one partition.
#[derive(Debug)]
pub struct CheckpointWriter {
    partition: PartitionId,
    latest_tx: watch::Sender<Option<u64>>,
    handle: JoinHandle<Result<Option<u64>>>,
}

impl CheckpointWriter {
    /// Starts the writer. `persisted` is the offset already in the store.
    pub fn spawn(
        partition: PartitionId,
        persisted: Option<u64>,
        store: Arc<dyn CheckpointStore>,
        retry: RetryConfig,
        health: HealthReporter,
    ) -> Self {
        let (latest_tx, latest_rx) = watch::channel(persisted);
        let task = WriterTask {
            partition,
            persisted,
            store,
            retry,
            health,
            degraded: false,
        };
        let handle = tokio::spawn(task.run(latest_rx));
        Self {
            partition,
            latest_tx,
            handle,
        }
    }

    /// Hands over a new checkpoint. Offsets at or below the current one are dropped.
    pub fn publish(&self, offset: u64) {
        let advanced = self.latest_tx.send_if_modified(|latest| {
            if latest.is_none_or(|current| offset > current) {
                *latest = Some(offset);
                true
            } else {
                false
            }
        });
        if advanced {
            pipeline_metrics()
                .checkpoint_offset
                .get_or_create(&partition_labels(self.partition))
                .set(offset as i64);
        }
    }

    /// Newest offset handed over, persisted or not.
    pub fn latest(&self) -> Option<u64> {
        *self.latest_tx.borrow()
    }

    /// Persists whatever is outstanding and stops the writer. Returns the last offset known to
    /// be durable, or the error of the final attempt.
    pub async fn flush(self) -> Result<Option<u64>> {
        let Self {
            partition,
            latest_tx,
            handle,
        } = self;
        drop(latest_tx);
        handle
            .await
            .map_err(|e| Error::CheckpointWrite(format!("writer of partition {partition}: {e}")))?
    }
}

struct WriterTask {
    partition: PartitionId,
    persisted: Option<u64>,
    store: Arc<dyn CheckpointStore>,
    retry: RetryConfig,
    health: HealthReporter,
    degraded: bool,
}

impl WriterTask {
    async fn run(mut self, mut latest_rx: watch::Receiver<Option<u64>>) -> Result<Option<u64>> {
        loop {
            // while degraded, retry on a timer too, not only when a newer offset shows up.
            let closed = tokio::select! {
                changed = latest_rx.changed() => changed.is_err(),
                _ = tokio::time::sleep(self.retry.max_interval), if self.degraded => false,
            };

            let latest = *latest_rx.borrow_and_update();
            if let Some(offset) = latest
                && self.persisted.is_none_or(|persisted| offset > persisted)
            {
                let outcome = self.persist(offset).await;
                if let Err(e) = outcome
                    && closed
                {
                    error!(partition = self.partition, offset, ?e, "Final checkpoint was not persisted");
                    return Err(e);
                }
            }

            if closed {
                info!(partition = self.partition, persisted = ?self.persisted, "Checkpoint writer stopped");
                return Ok(self.persisted);
            }
        }
    }

    async fn persist(&mut self, offset: u64) -> Result<()> {
        let partition = self.partition;
        let store = Arc::clone(&self.store);
        let result = Retry::new(
            self.retry.backoff(),
            move || {
                let store = Arc::clone(&store);
                async move { store.persist(partition, offset).await }
            },
            |e: &Error| e.is_transient(),
        )
        .await;

        match result {
            Ok(()) => {
                debug!(partition, offset, "Checkpoint persisted");
                self.persisted = Some(offset);
                if self.degraded {
                    self.degraded = false;
                    self.health
                        .clear(&HealthIssue::CheckpointDegraded(partition));
                }
                Ok(())
            }
            Err(e) => {
                warn!(partition, offset, ?e, "Checkpoint retries exhausted, durability degraded");
                if !self.degraded {
                    self.degraded = true;
                    self.health.raise(HealthIssue::CheckpointDegraded(partition));
                }
                Err(e)
            }
        }
    }
}
