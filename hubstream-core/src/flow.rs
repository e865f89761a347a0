//! Credit based flow control. Every partition starts with `max_pending_per_partition` credits;
//! the reader spends one credit per record it admits and the tracker gives it back once the
//! record reaches a terminal state. A partition without credits is not polled, which pushes back
//! on the log instead of buffering without bound.
//!
//! `credits + in_flight == max_pending_per_partition` holds for every partition at every point
//! where the state can be observed, both counters change under the same lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::Error;
use crate::Result;
use crate::message::PartitionId;

#[derive(Debug)]
struct CreditState {
    credits: usize,
    in_flight: usize,
}

#[derive(Debug)]
struct PartitionCredits {
    state: Mutex<CreditState>,
    released: Notify,
}

/// Shared by the readers (admit) and the trackers (release) of all partitions.
#[derive(Debug)]
pub struct FlowController {
    max_pending: usize,
    partitions: HashMap<PartitionId, Arc<PartitionCredits>>,
}

impl FlowController {
    pub fn new(partitions: impl IntoIterator<Item = PartitionId>, max_pending: usize) -> Self {
        let partitions = partitions
            .into_iter()
            .map(|partition| {
                let credits = PartitionCredits {
                    state: Mutex::new(CreditState {
                        credits: max_pending,
                        in_flight: 0,
                    }),
                    released: Notify::new(),
                };
                (partition, Arc::new(credits))
            })
            .collect();
        Self {
            max_pending,
            partitions,
        }
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Takes one credit if there is one. Unknown partitions are never admitted.
    pub fn try_admit(&self, partition: PartitionId) -> bool {
        let Some(partition) = self.partitions.get(&partition) else {
            return false;
        };
        let mut state = partition.state.lock();
        if state.credits == 0 {
            return false;
        }
        state.credits -= 1;
        state.in_flight += 1;
        true
    }

    /// Gives one credit back.
    pub fn release(&self, partition: PartitionId) -> Result<()> {
        self.release_many(partition, 1)
    }

    /// Gives `count` credits back at once. Returning more than is in flight is refused as a
    /// whole, it would break the credit invariant.
    pub fn release_many(&self, partition: PartitionId, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let credits = self
            .partitions
            .get(&partition)
            .ok_or_else(|| Error::Flow(format!("unknown partition {partition}")))?;
        {
            let mut state = credits.state.lock();
            if state.in_flight < count {
                return Err(Error::Flow(format!(
                    "partition {partition}: releasing {count} credits with only {} in flight",
                    state.in_flight
                )));
            }
            state.in_flight -= count;
            state.credits += count;
        }
        credits.released.notify_waiters();
        Ok(())
    }

    pub fn credits(&self, partition: PartitionId) -> Option<usize> {
        self.partitions
            .get(&partition)
            .map(|p| p.state.lock().credits)
    }

    pub fn in_flight(&self, partition: PartitionId) -> Option<usize> {
        self.partitions
            .get(&partition)
            .map(|p| p.state.lock().in_flight)
    }

    /// Resolves once the partition has at least one credit. Returns immediately for unknown
    /// partitions.
    pub async fn wait_for_credit(&self, partition: PartitionId) {
        let Some(credits) = self.partitions.get(&partition) else {
            return;
        };
        loop {
            let released = credits.released.notified();
            tokio::pin!(released);
            // register before checking so a release in between is not missed.
            released.as_mut().enable();
            if credits.state.lock().credits > 0 {
                return;
            }
            released.await;
        }
    }
}
