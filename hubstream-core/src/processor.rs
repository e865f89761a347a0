//! The processing stage runs a user supplied [Processor] on every delivery, on a worker pool
//! bounded by a semaphore. Results go on to the sink writer; a failed record is reported to its
//! partition's tracker, which redelivers it or gives up on it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::Error;
use crate::Result;
use crate::generator::DeviceEvent;
use crate::message::{Delivery, ProcessedRecord, Record};
use crate::metrics::{partition_labels, pipeline_metrics};
use crate::tracker::Trackers;

/// Why a record could not be processed. Becomes the failure reason reported to the tracker.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ProcessError(pub String);

impl ProcessError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Turns a record into what the sink persists. Must not block.
pub trait Processor: Send + Sync + 'static {
    fn process(&self, record: &Record) -> std::result::Result<ProcessedRecord, ProcessError>;
}

impl<F> Processor for F
where
    F: Fn(&Record) -> std::result::Result<ProcessedRecord, ProcessError> + Send + Sync + 'static,
{
    fn process(&self, record: &Record) -> std::result::Result<ProcessedRecord, ProcessError> {
        self(record)
    }
}

/// Hands every record over unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Processor for Passthrough {
    fn process(&self, record: &Record) -> std::result::Result<ProcessedRecord, ProcessError> {
        Ok(ProcessedRecord::passthrough(record))
    }
}

/// A device reading keyed the way a table store wants it: partitioned by device, one row per
/// event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRow {
    pub partition_key: String,
    pub row_key: String,
    pub device_value: i64,
}

/// Parses device events and turns them into [DeviceRow]s. Anything that is not a device event
/// fails, and eventually ends up with the error sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceEventProcessor;

impl Processor for DeviceEventProcessor {
    fn process(&self, record: &Record) -> std::result::Result<ProcessedRecord, ProcessError> {
        let event = DeviceEvent::from_bytes(&record.payload)
            .map_err(|e| ProcessError::new(e.to_string()))?;
        let row = DeviceRow {
            partition_key: event.device_id.to_string(),
            row_key: record.id().to_string(),
            device_value: event.device_value,
        };
        let payload = serde_json::to_vec(&row)
            .map_err(|e| ProcessError::new(format!("encoding device row: {e}")))?;
        Ok(ProcessedRecord::with_payload(record, payload))
    }
}

/// The worker pool between the readers and the sink writer.
pub struct ProcessingStage<P> {
    processor: Arc<P>,
    parallelism: usize,
    trackers: Trackers,
    channel_capacity: usize,
}

impl<P> ProcessingStage<P>
where
    P: Processor,
{
    pub fn new(processor: P, parallelism: usize, trackers: Trackers) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            processor: Arc::new(processor),
            parallelism,
            trackers,
            channel_capacity: parallelism * 2,
        }
    }

    /// Processes the input until it ends, then waits for the workers still running. The
    /// returned stream ends once every result has been sent.
    pub fn streaming_process(
        self,
        input: ReceiverStream<Delivery>,
    ) -> (ReceiverStream<Delivery<ProcessedRecord>>, JoinHandle<Result<()>>) {
        let (output_tx, output_rx) = mpsc::channel(self.channel_capacity);
        let handle = tokio::spawn(self.run(input, output_tx));
        (ReceiverStream::new(output_rx), handle)
    }

    async fn run(
        self,
        mut input: ReceiverStream<Delivery>,
        output_tx: mpsc::Sender<Delivery<ProcessedRecord>>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));

        while let Some(delivery) = input.next().await {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| Error::RecordProcessing(format!("failed to acquire semaphore: {e}")))?;
            let processor = Arc::clone(&self.processor);
            let trackers = self.trackers.clone();
            let output_tx = output_tx.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let id = delivery.item.id();
                match processor.process(&delivery.item) {
                    Ok(processed) => {
                        if output_tx.send(delivery.map(|_| processed)).await.is_err() {
                            debug!(%id, "Sink writer is gone, record stays pending");
                        }
                    }
                    Err(e) => {
                        warn!(%id, attempt = delivery.attempt, error = %e, "Processing failed");
                        pipeline_metrics()
                            .processing_errors_total
                            .get_or_create(&partition_labels(id.partition))
                            .inc();
                        if let Err(e) = trackers.fail(id, delivery.attempt, e.0).await {
                            warn!(%id, ?e, "Could not report processing failure");
                        }
                    }
                }
            });
        }

        info!("Processing input ended, waiting for in-flight work");
        let _all = semaphore
            .acquire_many_owned(self.parallelism as u32)
            .await
            .map_err(|e| Error::RecordProcessing(format!("failed to acquire semaphore: {e}")))?;
        info!("Processing stage stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::checkpoint::{CheckpointWriter, MemoryCheckpointStore};
    use crate::config::RetryConfig;
    use crate::flow::FlowController;
    use crate::health::{HealthReporter, MemoryErrorSink};
    use crate::tracker::ledger::AckLedger;
    use crate::tracker::{TrackerContext, TrackerHandle};

    #[test]
    fn test_device_event_processor() {
        let record = Record::new(1, 8, &br#"{"deviceId":5,"deviceValue":77}"#[..]);
        let processed = DeviceEventProcessor.process(&record).unwrap();
        let row: DeviceRow = serde_json::from_slice(&processed.payload).unwrap();
        assert_eq!(
            row,
            DeviceRow {
                partition_key: "5".into(),
                row_key: "1-8".into(),
                device_value: 77,
            }
        );
        assert_eq!(processed.id, record.id());

        let garbage = Record::new(1, 9, "not json");
        assert!(DeviceEventProcessor.process(&garbage).is_err());
    }

    #[test]
    fn test_closure_processor() {
        let upper = |record: &Record| -> std::result::Result<ProcessedRecord, ProcessError> {
            let text = String::from_utf8_lossy(&record.payload).to_uppercase();
            Ok(ProcessedRecord::with_payload(record, text))
        };
        let processed = upper.process(&Record::new(0, 0, "abc")).unwrap();
        assert_eq!(processed.payload.as_ref(), b"ABC");
    }

    #[tokio::test]
    async fn test_stage_forwards_and_fails_to_tracker() {
        let flow = Arc::new(FlowController::new([0], 8));
        let (redeliver_tx, mut redeliver_rx) = mpsc::channel(8);
        let tracker = TrackerHandle::spawn(
            AckLedger::new(0, None, 3),
            Duration::from_secs(60),
            TrackerContext {
                flow: Arc::clone(&flow),
                checkpoint: CheckpointWriter::spawn(
                    0,
                    None,
                    Arc::new(MemoryCheckpointStore::new()),
                    RetryConfig::default(),
                    HealthReporter::new(),
                ),
                error_sink: Arc::new(MemoryErrorSink::new()),
                redeliver_tx,
            },
        );
        let mut trackers = Trackers::new();
        trackers.insert(tracker.clone());

        let (input_tx, input_rx) = mpsc::channel(8);
        for offset in 0..4 {
            assert!(flow.try_admit(0));
            let record = Record::new(0, offset, if offset == 2 { "bad" } else { "ok" });
            tracker.register(record.clone()).await.unwrap();
            // offset 3 arrives as a redelivery.
            let attempt = if offset == 3 { 2 } else { 0 };
            input_tx.send(Delivery { item: record, attempt }).await.unwrap();
        }
        drop(input_tx);

        let reject_bad = |record: &Record| {
            if record.payload.as_ref() == b"bad" {
                Err(ProcessError::new("bad payload"))
            } else {
                Ok(ProcessedRecord::passthrough(record))
            }
        };
        let stage = ProcessingStage::new(reject_bad, 2, trackers);
        let (output, handle) = stage.streaming_process(ReceiverStream::new(input_rx));

        let mut processed: Vec<_> = output.map(|d| (d.item.id.offset, d.attempt)).collect().await;
        processed.sort_unstable();
        assert_eq!(processed, vec![(0, 0), (1, 0), (3, 2)]);
        handle.await.unwrap().unwrap();

        let redelivery = redeliver_rx.recv().await.unwrap();
        assert_eq!(redelivery.item.offset, 2);
        assert_eq!(redelivery.attempt, 1);
    }
}
