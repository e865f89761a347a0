//! Reading from the event log. A [PartitionReader] owns the read cursor of one partition: it
//! spends a flow control credit per record, hands every record it reads to the partition's
//! tracker before passing it on, and serves redeliveries ahead of new records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::retry::Retry;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::Result;
use crate::config::RetryConfig;
use crate::flow::FlowController;
use crate::health::{HealthIssue, HealthReporter};
use crate::message::{Delivery, PartitionId, Record};
use crate::metrics::{partition_labels, pipeline_metrics};
use crate::tracker::TrackerHandle;

/// An in-memory partitioned log, the stand-in for a hosted event hub.
pub mod memory;

/// Read side of a durable, partitioned, append-only log.
#[trait_variant::make(EventLog: Send)]
pub trait LocalEventLog {
    /// Partitions of the log in ascending order.
    async fn partitions(&self) -> Result<Vec<PartitionId>>;

    /// First record of the partition at or after `offset`, waiting at most `timeout` for one to
    /// be appended. A zero timeout never waits. Unreachable partitions fail with
    /// [Error::SourceUnavailable].
    async fn read(
        &self,
        partition: PartitionId,
        offset: u64,
        timeout: Duration,
    ) -> Result<Option<Record>>;
}

/// An event as handed to the producer side, before the log assigns it an offset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventData {
    pub payload: Bytes,
    pub properties: HashMap<String, String>,
}

impl EventData {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Write side of the log.
#[trait_variant::make(EventLogAppender: Send)]
pub trait LocalEventLogAppender {
    /// Appends the events in order and returns the offsets they were given.
    async fn append(&self, partition: PartitionId, events: Vec<EventData>) -> Result<Vec<u64>>;
}

/// What a single poll produced.
#[derive(Debug, PartialEq)]
pub enum PollOutcome {
    /// a new record, or a redelivery of one already in flight.
    Record(Delivery),
    /// nothing arrived within the read timeout.
    Empty,
    /// no credit left, the log was not read.
    Throttled,
}

/// Reader of one partition.
pub struct PartitionReader<L> {
    partition: PartitionId,
    log: Arc<L>,
    next_offset: u64,
    read_timeout: Duration,
    flow: Arc<FlowController>,
    tracker: TrackerHandle,
    redeliveries: mpsc::Receiver<Delivery>,
    retry: RetryConfig,
    health: HealthReporter,
    unavailable: bool,
}

/// Everything a reader needs besides the log itself.
pub struct ReaderContext {
    pub flow: Arc<FlowController>,
    pub tracker: TrackerHandle,
    pub redeliveries: mpsc::Receiver<Delivery>,
    pub retry: RetryConfig,
    pub health: HealthReporter,
}

impl<L> PartitionReader<L>
where
    L: EventLog + Sync,
{
    /// Creates a reader that starts at `next_offset`, normally the offset after the checkpoint.
    pub fn new(
        log: Arc<L>,
        partition: PartitionId,
        next_offset: u64,
        read_timeout: Duration,
        context: ReaderContext,
    ) -> Self {
        Self {
            partition,
            log,
            next_offset,
            read_timeout,
            flow: context.flow,
            tracker: context.tracker,
            redeliveries: context.redeliveries,
            retry: context.retry,
            health: context.health,
            unavailable: false,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Waits up to the read timeout for the next record.
    pub async fn poll(&mut self) -> Result<PollOutcome> {
        self.poll_with_timeout(self.read_timeout).await
    }

    /// Like [Self::poll] with an explicit timeout, zero makes it non-blocking.
    pub async fn poll_with_timeout(&mut self, timeout: Duration) -> Result<PollOutcome> {
        if let Ok(delivery) = self.redeliveries.try_recv() {
            return Ok(PollOutcome::Record(delivery));
        }

        if !self.flow.try_admit(self.partition) {
            pipeline_metrics()
                .throttled_total
                .get_or_create(&partition_labels(self.partition))
                .inc();
            return Ok(PollOutcome::Throttled);
        }

        match self.read_admitted(timeout).await {
            Ok(Some(record)) => Ok(PollOutcome::Record(Delivery::first(record))),
            Ok(None) => {
                self.flow.release(self.partition)?;
                Ok(PollOutcome::Empty)
            }
            Err(e) => {
                self.flow.release(self.partition)?;
                Err(e)
            }
        }
    }

    /// Reads one record with the credit already taken and registers it with the tracker.
    async fn read_admitted(&mut self, timeout: Duration) -> Result<Option<Record>> {
        let partition = self.partition;
        let offset = self.next_offset;
        let log: &L = self.log.as_ref();
        let read = Retry::new(
            self.retry.backoff(),
            move || log.read(partition, offset, timeout),
            |e: &Error| matches!(e, Error::SourceUnavailable(_)),
        )
        .await;

        let record = match read {
            Ok(record) => {
                if self.unavailable {
                    self.unavailable = false;
                    self.health
                        .clear(&HealthIssue::SourceUnavailable(partition));
                }
                record
            }
            Err(e @ Error::SourceUnavailable(_)) => {
                if !self.unavailable {
                    self.unavailable = true;
                    self.health.raise(HealthIssue::SourceUnavailable(partition));
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let Some(record) = record else {
            return Ok(None);
        };
        if record.partition != partition || record.offset < offset {
            return Err(Error::SourceUnavailable(format!(
                "log returned record {} when reading partition {partition} at {offset}",
                record.id()
            )));
        }

        self.next_offset = record.offset + 1;
        let labels = partition_labels(partition);
        pipeline_metrics().read_total.get_or_create(&labels).inc();
        pipeline_metrics()
            .read_bytes_total
            .get_or_create(&labels)
            .inc_by(record.payload.len() as u64);

        self.tracker.register(record.clone()).await?;
        Ok(Some(record))
    }

    /// Polls until cancelled, forwarding every delivery to `output`. Read errors that outlast
    /// the retries pause the partition for a while; nothing is skipped.
    pub async fn run(mut self, output: mpsc::Sender<Delivery>, cancel: CancellationToken) {
        let partition = self.partition;
        info!(partition, next_offset = self.next_offset, "Partition reader started");
        let pause = self.retry.max_interval;
        let flow = Arc::clone(&self.flow);

        while !cancel.is_cancelled() {
            let delivery = match self.poll().await {
                Ok(PollOutcome::Record(delivery)) => delivery,
                Ok(PollOutcome::Empty) => continue,
                Ok(PollOutcome::Throttled) => {
                    debug!(partition, "Out of credits");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = flow.wait_for_credit(partition) => continue,
                        redelivery = self.redeliveries.recv() => match redelivery {
                            Some(delivery) => delivery,
                            None => break,
                        },
                    }
                }
                Err(e) => {
                    error!(partition, ?e, "Reading partition failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => continue,
                    }
                }
            };

            if output.send(delivery).await.is_err() {
                warn!(partition, "Processing stage is gone, stopping reader");
                break;
            }
        }
        info!(partition, next_offset = self.next_offset, "Partition reader stopped");
    }
}
