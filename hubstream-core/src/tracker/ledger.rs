//! The bookkeeping behind the tracker, free of tasks and channels so every transition can be
//! driven directly.
//!
//! Entries live in an ordered map keyed by offset. The low-water-mark only moves by popping
//! terminal entries off the front of the map, so it can never pass an entry that is still
//! pending, no matter in which order completions arrive. Offsets need not be dense.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::Error;
use crate::Result;
use crate::health::PoisonRecord;
use crate::message::{Cursor, Delivery, PartitionId, Record};

/// Dispatch state of an in-flight record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Acked,
    /// failed on every allowed delivery, reported to the error sink.
    Poisoned,
}

impl EntryState {
    fn is_terminal(self) -> bool {
        !matches!(self, EntryState::Pending)
    }
}

#[derive(Debug)]
struct InFlightEntry {
    record: Record,
    state: EntryState,
    /// attempt currently out for delivery.
    attempt: u32,
    dispatched_at: Instant,
}

/// What became of a failure report.
#[derive(Debug, PartialEq)]
pub enum FailOutcome {
    /// deliver again with the next attempt number.
    Redeliver(Delivery),
    /// out of retries, hand over to the error sink.
    Poisoned(PoisonRecord),
    /// unknown offset, already terminal, or reported by a superseded attempt.
    Ignored,
}

/// Result of moving the low-water-mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    /// new checkpoint, the highest offset below which nothing is in flight.
    pub checkpoint: u64,
    /// entries removed, each of them owes the flow controller one credit.
    pub released: usize,
}

#[derive(Debug)]
pub struct AckLedger {
    partition: PartitionId,
    max_retries: u32,
    cursor: Cursor,
    entries: BTreeMap<u64, InFlightEntry>,
}

impl AckLedger {
    /// Starts from the stored checkpoint, if there is one.
    pub fn new(partition: PartitionId, checkpoint: Option<u64>, max_retries: u32) -> Self {
        Self {
            partition,
            max_retries,
            cursor: Cursor::from_checkpoint(checkpoint),
            entries: BTreeMap::new(),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Records not yet removed by advancement, terminal ones waiting behind a pending one
    /// included. This is what holds credits.
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    pub fn state_of(&self, offset: u64) -> Option<EntryState> {
        self.entries.get(&offset).map(|entry| entry.state)
    }

    /// Lowest offset still waiting for a completion.
    pub fn lowest_pending(&self) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.state == EntryState::Pending)
            .map(|(offset, _)| *offset)
    }

    /// Starts tracking a freshly read record. Offsets must keep increasing, anything at or
    /// below a previous registration (and so at or below the checkpoint) is refused.
    pub fn register(&mut self, record: Record, now: Instant) -> Result<()> {
        if record.partition != self.partition {
            return Err(Error::Tracker(format!(
                "record {} registered with the tracker of partition {}",
                record.id(),
                self.partition
            )));
        }
        if record.offset < self.cursor.next_offset {
            return Err(Error::Tracker(format!(
                "record {} is behind the cursor at {}",
                record.id(),
                self.cursor.next_offset
            )));
        }
        self.cursor.next_offset = record.offset + 1;
        self.entries.insert(
            record.offset,
            InFlightEntry {
                record,
                state: EntryState::Pending,
                attempt: 0,
                dispatched_at: now,
            },
        );
        Ok(())
    }

    /// Marks a record done. Any attempt may complete it. Returns whether anything changed.
    pub fn ack(&mut self, offset: u64) -> bool {
        match self.entries.get_mut(&offset) {
            Some(entry) if entry.state == EntryState::Pending => {
                entry.state = EntryState::Acked;
                true
            }
            _ => false,
        }
    }

    /// Handles a failed delivery: either schedules the next attempt or, once `max_retries`
    /// redeliveries have failed too, gives up on the record.
    pub fn fail(&mut self, offset: u64, attempt: u32, reason: &str, now: Instant) -> FailOutcome {
        let Some(entry) = self.entries.get_mut(&offset) else {
            return FailOutcome::Ignored;
        };
        if entry.state.is_terminal() || entry.attempt != attempt {
            return FailOutcome::Ignored;
        }

        if attempt < self.max_retries {
            entry.attempt = attempt + 1;
            entry.dispatched_at = now;
            return FailOutcome::Redeliver(Delivery {
                item: entry.record.clone(),
                attempt: entry.attempt,
            });
        }

        entry.state = EntryState::Poisoned;
        FailOutcome::Poisoned(PoisonRecord {
            record: entry.record.clone(),
            deliveries: attempt + 1,
            reason: reason.to_string(),
        })
    }

    /// Takes back the attempt handed out by [Self::fail] when its redelivery could not be
    /// queued. The record stays pending on the previous attempt and the next timeout scan offers
    /// it again, so only deliveries that actually went out count against `max_retries`.
    pub fn redelivery_dropped(&mut self, offset: u64, attempt: u32) {
        if let Some(entry) = self.entries.get_mut(&offset)
            && entry.state == EntryState::Pending
            && entry.attempt == attempt
        {
            entry.attempt = attempt.saturating_sub(1);
        }
    }

    /// Pending entries whose current attempt has been out for at least `ack_timeout`, as
    /// `(offset, attempt)` pairs ready to be failed.
    pub fn expired(&self, now: Instant, ack_timeout: Duration) -> Vec<(u64, u32)> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                entry.state == EntryState::Pending
                    && now.saturating_duration_since(entry.dispatched_at) >= ack_timeout
            })
            .map(|(offset, entry)| (*offset, entry.attempt))
            .collect()
    }

    /// Pops terminal entries off the front until the first pending one.
    pub fn advance(&mut self) -> Option<Advance> {
        let mut released = 0;
        let mut checkpoint = None;
        while let Some(entry) = self.entries.first_entry() {
            if !entry.get().state.is_terminal() {
                break;
            }
            checkpoint = Some(*entry.key());
            entry.remove();
            released += 1;
        }

        let checkpoint = checkpoint?;
        self.cursor.last_checkpointed = Some(checkpoint);
        Some(Advance {
            checkpoint,
            released,
        })
    }

    /// Forgets everything still in flight, returning how many credits that frees. Used on
    /// shutdown; none of these offsets gets checkpointed, so they are read again after restart.
    pub fn abandon(&mut self) -> usize {
        let abandoned = self.entries.len();
        self.entries.clear();
        abandoned
    }
}
