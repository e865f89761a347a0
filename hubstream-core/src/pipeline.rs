//! The reader pipeline wires the components of one consumer together.
//!
//! ```text
//! (reader p0) --+
//! (reader p1) --+--[c]--> (processing stage) --[c]--> (sink writer)
//! (reader pN) --+                                           |
//!     ^   |                                                 |
//!     |   +------> {tracker p*} <---------- ack / fail -----+
//!     |                |    |
//!     +-- redeliver ---+    +--> {checkpoint writer p*} --> (checkpoint store)
//!
//! [c] - bounded channel
//! {}  - actor per partition
//! ```
//!
//! Shutdown is driven by a [CancellationToken]: the readers stop polling, the processing stage
//! and the sink writer drain whatever is already queued, and every tracker flushes its final
//! checkpoint. Records still pending at that point are read again after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Error;
use crate::Result;
use crate::checkpoint::{CheckpointStore, CheckpointWriter};
use crate::config::PipelineConfig;
use crate::flow::FlowController;
use crate::health::{ErrorSink, HealthReporter, LogErrorSink};
use crate::message::{Cursor, PartitionId};
use crate::processor::{ProcessingStage, Processor};
use crate::sinker::{Sink, SinkWriter};
use crate::source::{EventLog, PartitionReader, ReaderContext};
use crate::tracker::ledger::AckLedger;
use crate::tracker::{TrackerContext, TrackerHandle, Trackers};

/// The writer pipeline, filling an event log with generated device events.
pub mod writer;

/// Final state of a reader pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    /// last durable checkpoint of every partition, `None` if nothing was ever checkpointed.
    pub checkpoints: HashMap<PartitionId, Option<u64>>,
}

pub struct ReaderPipeline<L, P, S> {
    config: PipelineConfig,
    log: Arc<L>,
    processor: P,
    sink: S,
    checkpoint_store: Arc<dyn CheckpointStore>,
    error_sink: Arc<dyn ErrorSink>,
    health: HealthReporter,
}

impl<L, P, S> ReaderPipeline<L, P, S>
where
    L: EventLog + Send + Sync + 'static,
    P: Processor,
    S: Sink + Send + 'static,
{
    pub fn new(
        config: PipelineConfig,
        log: Arc<L>,
        processor: P,
        sink: S,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            log,
            processor,
            sink,
            checkpoint_store,
            error_sink: Arc::new(LogErrorSink),
            health: HealthReporter::new(),
        }
    }

    pub fn with_error_sink(mut self, error_sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = error_sink;
        self
    }

    pub fn with_health(mut self, health: HealthReporter) -> Self {
        self.health = health;
        self
    }

    /// The partitions of the log, which must match the configured partition count.
    async fn discover_partitions(&self) -> Result<Vec<PartitionId>> {
        let partitions = self.log.partitions().await?;
        if partitions.len() != usize::from(self.config.partition_count) {
            return Err(Error::Config(format!(
                "partitionCount is {} but the event log has {} partitions",
                self.config.partition_count,
                partitions.len()
            )));
        }
        Ok(partitions)
    }

    /// Runs until `cancel` fires, then drains and flushes the final checkpoints.
    pub async fn run(self, cancel: CancellationToken) -> Result<PipelineReport> {
        self.config.validate_limits()?;
        let partitions = self.discover_partitions().await?;
        let max_pending = self.config.max_pending_per_partition;
        let flow = Arc::new(FlowController::new(partitions.iter().copied(), max_pending));

        let mut trackers = Trackers::new();
        let mut readers = Vec::with_capacity(partitions.len());
        for &partition in &partitions {
            let checkpoint = self.checkpoint_store.load(partition).await?;
            let cursor = Cursor::from_checkpoint(checkpoint);
            info!(partition, ?checkpoint, next_offset = cursor.next_offset, "Resuming partition");

            let (redeliver_tx, redeliver_rx) = mpsc::channel(max_pending);
            let tracker = TrackerHandle::spawn(
                AckLedger::new(partition, checkpoint, self.config.max_retries),
                self.config.ack_timeout,
                TrackerContext {
                    flow: Arc::clone(&flow),
                    checkpoint: CheckpointWriter::spawn(
                        partition,
                        checkpoint,
                        Arc::clone(&self.checkpoint_store),
                        self.config.retry.clone(),
                        self.health.clone(),
                    ),
                    error_sink: Arc::clone(&self.error_sink),
                    redeliver_tx,
                },
            );
            trackers.insert(tracker.clone());

            readers.push(PartitionReader::new(
                Arc::clone(&self.log),
                partition,
                cursor.next_offset,
                self.config.read_timeout,
                ReaderContext {
                    flow: Arc::clone(&flow),
                    tracker,
                    redeliveries: redeliver_rx,
                    retry: self.config.retry.clone(),
                    health: self.health.clone(),
                },
            ));
        }

        // readers also stop when a downstream task ends early.
        let stop = cancel.child_token();
        let (read_tx, read_rx) = mpsc::channel(self.config.batch.max_batch_size);
        let reader_handles: Vec<_> = readers
            .into_iter()
            .map(|reader| tokio::spawn(reader.run(read_tx.clone(), stop.clone())))
            .collect();
        drop(read_tx);

        let stage = ProcessingStage::new(self.processor, self.config.parallelism, trackers.clone());
        let (processed, stage_handle) = stage.streaming_process(ReceiverStream::new(read_rx));

        let sink_writer = SinkWriter::new(
            self.sink,
            trackers.clone(),
            self.config.batch.clone(),
            self.config.retry.clone(),
            self.health.clone(),
        );
        let sink_handle = sink_writer.streaming_write(processed);
        info!(pipeline = %self.config.name, partitions = partitions.len(), "Reader pipeline started");

        let (readers_result, stage_result, sink_result) = tokio::join!(
            try_join_all(reader_handles),
            async {
                let result = stage_handle.await;
                stop.cancel();
                result
            },
            async {
                let result = sink_handle.await;
                stop.cancel();
                result
            }
        );

        // flush checkpoints before reporting any failure, acked work must not be lost.
        let checkpoints = trackers.shutdown().await;

        readers_result.map_err(|e| Error::Forwarder(format!("reader task failed: {e}")))?;
        stage_result
            .map_err(|e| Error::Forwarder(format!("processing task failed: {e}")))?
            .inspect_err(|e| error!(?e, "Processing stage failed"))?;
        sink_result
            .map_err(|e| Error::Forwarder(format!("sink writer task failed: {e}")))?
            .inspect_err(|e| error!(?e, "Sink writer failed"))?;

        let checkpoints = checkpoints?;
        info!(?checkpoints, "Reader pipeline stopped");
        Ok(PipelineReport { checkpoints })
    }
}
