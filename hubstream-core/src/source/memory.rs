use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::Error;
use crate::Result;
use crate::message::{PartitionId, Record};
use crate::source::{EventData, EventLog, EventLogAppender};

#[derive(Debug, Default)]
struct PartitionLog {
    records: Mutex<Vec<Record>>,
    appended: Notify,
    /// reads left that fail with [Error::SourceUnavailable].
    failing_reads: AtomicUsize,
}

/// Partitioned append-only log held in memory. Clones share the same partitions.
///
/// Offsets start at 0 and grow by `offset_step`, a step above one leaves the gaps real event hub
/// offsets have.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    partitions: Arc<HashMap<PartitionId, PartitionLog>>,
    offset_step: u64,
}

impl MemoryLog {
    pub fn new(partition_count: u16) -> Self {
        Self::with_offset_step(partition_count, 1)
    }

    pub fn with_offset_step(partition_count: u16, offset_step: u64) -> Self {
        let partitions = (0..partition_count)
            .map(|partition| (partition, PartitionLog::default()))
            .collect();
        Self {
            partitions: Arc::new(partitions),
            offset_step: offset_step.max(1),
        }
    }

    fn partition(&self, partition: PartitionId) -> Result<&PartitionLog> {
        self.partitions
            .get(&partition)
            .ok_or_else(|| Error::SourceUnavailable(format!("no partition {partition}")))
    }

    /// Number of records in the partition, zero for unknown partitions.
    pub fn len(&self, partition: PartitionId) -> usize {
        self.partitions
            .get(&partition)
            .map_or(0, |p| p.records.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(|p| p.records.lock().is_empty())
    }

    /// Copy of every record in the partition.
    pub fn records(&self, partition: PartitionId) -> Vec<Record> {
        self.partitions
            .get(&partition)
            .map(|p| p.records.lock().clone())
            .unwrap_or_default()
    }

    /// Makes the next `count` reads of the partition fail as if the hub were unreachable.
    pub fn inject_read_failures(&self, partition: PartitionId, count: usize) {
        if let Some(p) = self.partitions.get(&partition) {
            p.failing_reads.store(count, Ordering::SeqCst);
        }
    }

    fn take_failure(log: &PartitionLog) -> bool {
        log.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn find(log: &PartitionLog, offset: u64) -> Option<Record> {
        let records = log.records.lock();
        let index = records.partition_point(|record| record.offset < offset);
        records.get(index).cloned()
    }
}

impl EventLog for MemoryLog {
    async fn partitions(&self) -> Result<Vec<PartitionId>> {
        let mut partitions: Vec<_> = self.partitions.keys().copied().collect();
        partitions.sort_unstable();
        Ok(partitions)
    }

    async fn read(
        &self,
        partition: PartitionId,
        offset: u64,
        timeout: Duration,
    ) -> Result<Option<Record>> {
        let log = self.partition(partition)?;
        if Self::take_failure(log) {
            return Err(Error::SourceUnavailable(format!(
                "partition {partition} is unreachable"
            )));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let appended = log.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(record) = Self::find(log, offset) {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }
}

impl EventLogAppender for MemoryLog {
    async fn append(&self, partition: PartitionId, events: Vec<EventData>) -> Result<Vec<u64>> {
        let log = self.partition(partition)?;
        let offsets = {
            let mut records = log.records.lock();
            let mut next = records
                .last()
                .map_or(0, |record| record.offset + self.offset_step);
            let enqueue_time = Utc::now();
            events
                .into_iter()
                .map(|event| {
                    let offset = next;
                    next += self.offset_step;
                    records.push(Record {
                        partition,
                        offset,
                        enqueue_time,
                        payload: event.payload,
                        properties: Arc::new(event.properties),
                    });
                    offset
                })
                .collect()
        };
        log.appended.notify_waiters();
        Ok(offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_assigns_increasing_offsets() {
        let log = MemoryLog::with_offset_step(2, 10);
        let offsets = log
            .append(1, vec![EventData::new("a"), EventData::new("b")])
            .await
            .unwrap();
        assert_eq!(offsets, vec![0, 10]);
        let offsets = log.append(1, vec![EventData::new("c")]).await.unwrap();
        assert_eq!(offsets, vec![20]);
        assert_eq!(log.len(1), 3);
        assert_eq!(log.len(0), 0);
        assert_eq!(log.partitions().await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_read_skips_gaps() {
        let log = MemoryLog::with_offset_step(1, 5);
        log.append(0, vec![EventData::new("a"), EventData::new("b")])
            .await
            .unwrap();

        let record = log.read(0, 1, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(record.offset, 5);
        assert_eq!(record.payload.as_ref(), b"b");
        assert!(log.read(0, 6, Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_waits_for_append() {
        let log = MemoryLog::new(1);
        let reader = {
            let log = log.clone();
            tokio::spawn(async move { log.read(0, 0, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append(0, vec![EventData::new("late").with_property("k", "v")])
            .await
            .unwrap();

        let record = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(record.offset, 0);
        assert_eq!(record.properties.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_injected_failures_and_unknown_partition() {
        let log = MemoryLog::new(1);
        log.inject_read_failures(0, 1);
        assert!(matches!(
            log.read(0, 0, Duration::ZERO).await,
            Err(Error::SourceUnavailable(_))
        ));
        assert!(log.read(0, 0, Duration::ZERO).await.unwrap().is_none());
        assert!(matches!(
            log.read(3, 0, Duration::ZERO).await,
            Err(Error::SourceUnavailable(_))
        ));
    }
}
