//! Health and error reporting. Transient failures are retried where they happen; only when the
//! retries are exhausted do they show up here, either as a [HealthIssue] raised on the
//! [HealthReporter] (and cleared again on recovery) or, for records that can never be processed,
//! as a [PoisonRecord] handed to an [ErrorSink].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::message::{PartitionId, Record};

/// Something degraded but not fatal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthIssue {
    /// reads from the partition kept failing past the retry cap.
    SourceUnavailable(PartitionId),
    /// checkpoints of the partition cannot be persisted, progress is held in memory only.
    CheckpointDegraded(PartitionId),
    /// the sink kept failing past the batch retry cap.
    SinkUnavailable,
}

/// Snapshot of all open issues.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthStatus {
    pub issues: BTreeSet<HealthIssue>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Cheap to clone, all clones share the same state.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    issues: Arc<Mutex<BTreeSet<HealthIssue>>>,
    status_tx: Arc<watch::Sender<HealthStatus>>,
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthReporter {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(HealthStatus::default());
        Self {
            issues: Arc::new(Mutex::new(BTreeSet::new())),
            status_tx: Arc::new(status_tx),
        }
    }

    /// Raises an issue. Raising an open issue again is a no-op.
    pub fn raise(&self, issue: HealthIssue) {
        let mut issues = self.issues.lock();
        if issues.insert(issue.clone()) {
            warn!(?issue, "Health degraded");
            self.publish(&issues);
        }
    }

    /// Clears an issue after recovery. Clearing an issue that is not open is a no-op.
    pub fn clear(&self, issue: &HealthIssue) {
        let mut issues = self.issues.lock();
        if issues.remove(issue) {
            info!(?issue, "Health recovered");
            self.publish(&issues);
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status_tx.subscribe()
    }

    fn publish(&self, issues: &BTreeSet<HealthIssue>) {
        self.status_tx.send_replace(HealthStatus {
            issues: issues.clone(),
        });
    }
}

/// A record given up on after exhausting its redeliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct PoisonRecord {
    pub record: Record,
    /// deliveries made, the first one included.
    pub deliveries: u32,
    pub reason: String,
}

/// Destination of poison records. A record is treated as done for checkpointing only after it
/// has been reported here.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn report(&self, poison: PoisonRecord);
}

/// Reports poison records to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

#[async_trait]
impl ErrorSink for LogErrorSink {
    async fn report(&self, poison: PoisonRecord) {
        error!(
            id = %poison.record.id(),
            deliveries = poison.deliveries,
            reason = %poison.reason,
            payload_len = poison.record.payload.len(),
            "Giving up on poison record"
        );
    }
}

/// Keeps poison records in memory, for inspection and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryErrorSink {
    records: Arc<Mutex<Vec<PoisonRecord>>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PoisonRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl ErrorSink for MemoryErrorSink {
    async fn report(&self, poison: PoisonRecord) {
        self.records.lock().push(poison);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_and_clear() {
        let health = HealthReporter::new();
        let mut status_rx = health.subscribe();
        assert!(health.status().is_healthy());

        health.raise(HealthIssue::CheckpointDegraded(1));
        health.raise(HealthIssue::CheckpointDegraded(1));
        health.raise(HealthIssue::SourceUnavailable(0));
        assert!(status_rx.has_changed().unwrap());
        let status = status_rx.borrow_and_update().clone();
        assert_eq!(status.issues.len(), 2);

        health.clear(&HealthIssue::CheckpointDegraded(1));
        health.clear(&HealthIssue::SinkUnavailable);
        assert_eq!(
            health.status().issues.into_iter().collect::<Vec<_>>(),
            vec![HealthIssue::SourceUnavailable(0)]
        );

        health.clear(&HealthIssue::SourceUnavailable(0));
        assert!(health.status().is_healthy());
    }

    #[test]
    fn test_clones_share_state() {
        let health = HealthReporter::new();
        let other = health.clone();
        other.raise(HealthIssue::SinkUnavailable);
        assert!(!health.status().is_healthy());
    }

    #[tokio::test]
    async fn test_memory_error_sink() {
        let sink = MemoryErrorSink::new();
        sink.report(PoisonRecord {
            record: Record::new(0, 4, "bad"),
            deliveries: 3,
            reason: "unparseable".into(),
        })
        .await;
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.offset, 4);
    }
}
