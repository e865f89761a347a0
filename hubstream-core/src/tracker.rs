//! The tracker follows every record of one partition from the moment it is read until it is
//! acked or given up on. It is an actor: the reader, the processing stage and the sink writer
//! talk to it through a cloneable [TrackerHandle], and all bookkeeping happens in the
//! [AckLedger] owned by the actor task.
//!
//! Every terminal transition may move the low-water-mark. When it moves, the new checkpoint is
//! handed to the partition's [CheckpointWriter] and the credits of the removed entries go back to
//! the [FlowController]. Failed records are pushed onto the redelivery channel the reader drains
//! before it polls the log again. A periodic scan fails records that stayed pending longer than
//! the ack timeout, so a lost completion only ever delays a record.
//!
//! Delivery is at-least-once: a record that timed out may still be completed by its slow first
//! attempt, and a crash before the checkpoint is persisted replays it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::Result;
use crate::checkpoint::CheckpointWriter;
use crate::flow::FlowController;
use crate::health::ErrorSink;
use crate::message::{Cursor, Delivery, PartitionId, Record, RecordId};
use crate::metrics::{partition_labels, pipeline_metrics};

pub mod ledger;

use ledger::{AckLedger, FailOutcome};

const MAILBOX_CAPACITY: usize = 500;
const ACK_TIMEOUT_REASON: &str = "ack timeout";

/// ActorMessage represents the messages that can be sent to the Tracker actor.
enum ActorMessage {
    Register {
        record: Record,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Ack {
        offset: u64,
    },
    Fail {
        offset: u64,
        attempt: u32,
        reason: String,
    },
    Cursor {
        respond_to: oneshot::Sender<Cursor>,
    },
    InFlight {
        respond_to: oneshot::Sender<usize>,
    },
    Shutdown {
        respond_to: oneshot::Sender<Result<Option<u64>>>,
    },
}

/// Everything a tracker hands its results to.
pub struct TrackerContext {
    pub flow: Arc<FlowController>,
    pub checkpoint: CheckpointWriter,
    pub error_sink: Arc<dyn ErrorSink>,
    /// feeds the reader of the partition, sized to the credits so it never fills up.
    pub redeliver_tx: mpsc::Sender<Delivery>,
}

struct Tracker {
    ledger: AckLedger,
    ack_timeout: Duration,
    flow: Arc<FlowController>,
    checkpoint: Option<CheckpointWriter>,
    error_sink: Arc<dyn ErrorSink>,
    redeliver_tx: mpsc::Sender<Delivery>,
    receiver: mpsc::Receiver<ActorMessage>,
}

impl Tracker {
    async fn run(mut self) {
        let mut scan = tokio::time::interval(scan_interval(self.ack_timeout));
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately.
        scan.tick().await;

        loop {
            tokio::select! {
                message = self.receiver.recv() => {
                    let Some(message) = message else {
                        // every handle is gone, still persist what is known to be done.
                        if let Err(e) = self.shutdown().await {
                            error!(partition = self.ledger.partition(), ?e, "Tracker stopped without a final checkpoint");
                        }
                        return;
                    };
                    if !self.handle_message(message).await {
                        return;
                    }
                }
                _ = scan.tick() => self.expire().await,
            }
        }
    }

    /// Returns false once the tracker has shut down.
    async fn handle_message(&mut self, message: ActorMessage) -> bool {
        match message {
            ActorMessage::Register { record, respond_to } => {
                let result = self.ledger.register(record, Instant::now());
                self.update_in_flight();
                let _ = respond_to.send(result);
            }
            ActorMessage::Ack { offset } => {
                if self.ledger.ack(offset) {
                    pipeline_metrics()
                        .ack_total
                        .get_or_create(&partition_labels(self.ledger.partition()))
                        .inc();
                    self.advance();
                }
            }
            ActorMessage::Fail {
                offset,
                attempt,
                reason,
            } => {
                self.handle_fail(offset, attempt, &reason).await;
            }
            ActorMessage::Cursor { respond_to } => {
                let _ = respond_to.send(self.ledger.cursor());
            }
            ActorMessage::InFlight { respond_to } => {
                let _ = respond_to.send(self.ledger.in_flight());
            }
            ActorMessage::Shutdown { respond_to } => {
                self.receiver.close();
                let result = self.shutdown().await;
                let _ = respond_to.send(result);
                return false;
            }
        }
        true
    }

    async fn handle_fail(&mut self, offset: u64, attempt: u32, reason: &str) {
        let partition = self.ledger.partition();
        match self.ledger.fail(offset, attempt, reason, Instant::now()) {
            FailOutcome::Redeliver(delivery) => {
                let next_attempt = delivery.attempt;
                if let Err(e) = self.redeliver_tx.try_send(delivery) {
                    // stays pending on the old attempt, the timeout scan offers it again.
                    warn!(partition, offset, ?e, "Redelivery not queued");
                    self.ledger.redelivery_dropped(offset, next_attempt);
                    return;
                }
                debug!(partition, offset, attempt = next_attempt, reason, "Redelivering record");
                pipeline_metrics()
                    .redelivered_total
                    .get_or_create(&partition_labels(partition))
                    .inc();
            }
            FailOutcome::Poisoned(poison) => {
                warn!(partition, offset, deliveries = poison.deliveries, reason, "Record exhausted its retries");
                pipeline_metrics()
                    .poison_total
                    .get_or_create(&partition_labels(partition))
                    .inc();
                self.error_sink.report(poison).await;
                self.advance();
            }
            FailOutcome::Ignored => {
                debug!(partition, offset, attempt, "Ignoring stale failure");
            }
        }
    }

    async fn expire(&mut self) {
        let expired = self.ledger.expired(Instant::now(), self.ack_timeout);
        for (offset, attempt) in expired {
            self.handle_fail(offset, attempt, ACK_TIMEOUT_REASON).await;
        }
    }

    fn advance(&mut self) {
        let partition = self.ledger.partition();
        if let Some(advance) = self.ledger.advance() {
            if let Some(checkpoint) = &self.checkpoint {
                checkpoint.publish(advance.checkpoint);
            }
            if let Err(e) = self.flow.release_many(partition, advance.released) {
                error!(partition, ?e, "Releasing credits failed");
            }
            self.update_in_flight();
        }
    }

    fn update_in_flight(&self) {
        pipeline_metrics()
            .in_flight
            .get_or_create(&partition_labels(self.ledger.partition()))
            .set(self.ledger.in_flight() as i64);
    }

    /// Drops whatever is still in flight, returns its credits and flushes the last checkpoint.
    async fn shutdown(&mut self) -> Result<Option<u64>> {
        let partition = self.ledger.partition();
        let abandoned = self.ledger.abandon();
        if abandoned > 0 {
            info!(partition, abandoned, "Records left in flight will be replayed after restart");
        }
        let released = self.flow.release_many(partition, abandoned);
        self.update_in_flight();

        let flushed = match self.checkpoint.take() {
            Some(checkpoint) => checkpoint.flush().await,
            None => Ok(self.ledger.cursor().last_checkpointed),
        };
        released?;
        flushed
    }
}

/// The scan runs a few times per timeout so a record is failed close to its deadline.
fn scan_interval(ack_timeout: Duration) -> Duration {
    (ack_timeout / 4).max(Duration::from_millis(10))
}

/// TrackerHandle is the cloneable interface to the tracker of one partition.
#[derive(Clone)]
pub struct TrackerHandle {
    partition: PartitionId,
    sender: mpsc::Sender<ActorMessage>,
}

impl TrackerHandle {
    /// Spawns the tracker actor of `ledger.partition()`.
    pub fn spawn(ledger: AckLedger, ack_timeout: Duration, context: TrackerContext) -> Self {
        let partition = ledger.partition();
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let tracker = Tracker {
            ledger,
            ack_timeout,
            flow: context.flow,
            checkpoint: Some(context.checkpoint),
            error_sink: context.error_sink,
            redeliver_tx: context.redeliver_tx,
            receiver,
        };
        tokio::spawn(tracker.run());
        Self { partition, sender }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Starts tracking a record that was just read. The record's credit must already be taken.
    pub async fn register(&self, record: Record) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::Register { record, respond_to })
            .await?;
        response
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    pub async fn ack(&self, offset: u64) -> Result<()> {
        self.send(ActorMessage::Ack { offset }).await
    }

    /// Reports a failed delivery attempt.
    pub async fn fail(&self, offset: u64, attempt: u32, reason: impl Into<String>) -> Result<()> {
        self.send(ActorMessage::Fail {
            offset,
            attempt,
            reason: reason.into(),
        })
        .await
    }

    pub async fn cursor(&self) -> Result<Cursor> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::Cursor { respond_to }).await?;
        response
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    /// Entries not yet removed by advancement, the number of credits the partition is using.
    pub async fn in_flight(&self) -> Result<usize> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::InFlight { respond_to }).await?;
        response
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    /// Stops the tracker and flushes its final checkpoint. Records still pending are not
    /// checkpointed. Returns the last durable offset.
    pub async fn shutdown(&self) -> Result<Option<u64>> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::Shutdown { respond_to }).await?;
        response
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    async fn send(&self, message: ActorMessage) -> Result<()> {
        self.sender.send(message).await.map_err(|_| {
            Error::Tracker(format!("tracker of partition {} is gone", self.partition))
        })
    }
}

/// Routes completions to the tracker of the record's partition.
#[derive(Clone, Default)]
pub struct Trackers {
    handles: HashMap<PartitionId, TrackerHandle>,
}

impl Trackers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: TrackerHandle) {
        self.handles.insert(handle.partition(), handle);
    }

    pub fn get(&self, partition: PartitionId) -> Result<&TrackerHandle> {
        self.handles
            .get(&partition)
            .ok_or_else(|| Error::Tracker(format!("no tracker for partition {partition}")))
    }

    pub async fn ack(&self, id: RecordId) -> Result<()> {
        self.get(id.partition)?.ack(id.offset).await
    }

    pub async fn fail(&self, id: RecordId, attempt: u32, reason: impl Into<String>) -> Result<()> {
        self.get(id.partition)?.fail(id.offset, attempt, reason).await
    }

    /// Shuts every tracker down, flushing all checkpoints. Reports the first failure after
    /// trying all of them.
    pub async fn shutdown(&self) -> Result<HashMap<PartitionId, Option<u64>>> {
        let mut checkpoints = HashMap::with_capacity(self.handles.len());
        let mut first_error = None;
        for (partition, handle) in &self.handles {
            match handle.shutdown().await {
                Ok(checkpoint) => {
                    checkpoints.insert(*partition, checkpoint);
                }
                Err(e) => {
                    error!(partition = *partition, ?e, "Final checkpoint failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(checkpoints),
        }
    }
}
