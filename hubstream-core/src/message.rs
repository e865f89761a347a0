//! Records flow from the event log through the processing stage to the sink. A [Record] is what
//! the log hands out, a [ProcessedRecord] is what the processing stage produces, and a [Delivery]
//! pairs either of them with the delivery attempt so that completions from a stale attempt can
//! be told apart from the current one after a redelivery.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a partition of the event log.
pub type PartitionId = u16;

/// Position of a record: unique across the whole log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub partition: PartitionId,
    pub offset: u64,
}

impl RecordId {
    pub fn new(partition: PartitionId, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.partition, self.offset)
    }
}

/// An immutable event read from one partition of the log.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub partition: PartitionId,
    /// strictly increasing within the partition, not necessarily dense.
    pub offset: u64,
    pub enqueue_time: DateTime<Utc>,
    /// opaque to everything but the processing stage.
    pub payload: Bytes,
    /// application properties attached by the producer.
    pub properties: Arc<HashMap<String, String>>,
}

impl Record {
    pub fn new(partition: PartitionId, offset: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            enqueue_time: Utc::now(),
            payload: payload.into(),
            properties: Arc::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> RecordId {
        RecordId::new(self.partition, self.offset)
    }
}

/// Output of the processing stage for one [Record].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRecord {
    /// the record this was produced from, used to route the ack back.
    pub id: RecordId,
    pub enqueue_time: DateTime<Utc>,
    pub payload: Bytes,
    pub properties: Arc<HashMap<String, String>>,
}

impl ProcessedRecord {
    /// A processed record carrying the input unchanged.
    pub fn passthrough(record: &Record) -> Self {
        Self {
            id: record.id(),
            enqueue_time: record.enqueue_time,
            payload: record.payload.clone(),
            properties: Arc::clone(&record.properties),
        }
    }

    /// Same position and enqueue time, new payload.
    pub fn with_payload(record: &Record, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::passthrough(record)
        }
    }

    /// Views the processed output as a record at the position of its source, which is what the
    /// codec-based sinks persist.
    pub fn to_record(&self) -> Record {
        Record {
            partition: self.id.partition,
            offset: self.id.offset,
            enqueue_time: self.enqueue_time,
            payload: self.payload.clone(),
            properties: Arc::clone(&self.properties),
        }
    }
}

/// One attempt at pushing an item through the pipeline. The first delivery is attempt 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<T = Record> {
    pub item: T,
    pub attempt: u32,
}

impl<T> Delivery<T> {
    pub fn first(item: T) -> Self {
        Self { item, attempt: 0 }
    }

    /// Same attempt, different item. Used when the processing stage turns a record into its
    /// processed form.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Delivery<U> {
        Delivery {
            item: f(self.item),
            attempt: self.attempt,
        }
    }
}

/// Read position of one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// next offset the reader asks the log for.
    pub next_offset: u64,
    /// highest offset made durable, `None` before the first checkpoint.
    pub last_checkpointed: Option<u64>,
}

impl Cursor {
    /// Resumes right after the stored checkpoint, or at the start of the partition.
    pub fn from_checkpoint(checkpoint: Option<u64>) -> Self {
        Self {
            next_offset: checkpoint.map_or(0, |offset| offset + 1),
            last_checkpointed: checkpoint,
        }
    }

    /// First offset that would be replayed after a crash right now.
    pub fn replay_from(&self) -> u64 {
        self.last_checkpointed.map_or(0, |offset| offset + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_display() {
        assert_eq!(RecordId::new(3, 42).to_string(), "3-42");
    }

    #[test]
    fn cursor_resumes_after_checkpoint() {
        let fresh = Cursor::from_checkpoint(None);
        assert_eq!(fresh.next_offset, 0);
        assert_eq!(fresh.replay_from(), 0);

        let resumed = Cursor::from_checkpoint(Some(9));
        assert_eq!(resumed.next_offset, 10);
        assert_eq!(resumed.replay_from(), 10);
        assert_eq!(resumed.last_checkpointed, Some(9));
    }

    #[test]
    fn processed_record_keeps_position() {
        let record = Record::new(1, 7, "raw");
        let processed = ProcessedRecord::with_payload(&record, "cooked");
        assert_eq!(processed.id, RecordId::new(1, 7));

        let persisted = processed.to_record();
        assert_eq!(persisted.offset, 7);
        assert_eq!(persisted.payload, Bytes::from_static(b"cooked"));
        assert_eq!(persisted.enqueue_time, record.enqueue_time);
    }

    #[test]
    fn delivery_map_keeps_attempt() {
        let delivery = Delivery {
            item: 1u8,
            attempt: 2,
        };
        let mapped = delivery.map(|v| v.to_string());
        assert_eq!(mapped.item, "1");
        assert_eq!(mapped.attempt, 2);
    }
}
