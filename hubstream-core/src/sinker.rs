//! The sink writer batches processed records, writes them with a [Sink] and reports the fate of
//! every record back through a [Completion], which for the reader pipeline are the partition
//! trackers.
//!
//! A call that fails as a whole ([Error::SinkUnavailable]) is retried with backoff. What
//! happens to individual failures depends on the sink:
//!  - a sink that supports partial acknowledgement has its successes acked right away and its
//!    failures handed back one by one, the tracker redelivers them;
//!  - any other sink has a batch with a failure retried as a unit, and once the retries are
//!    exhausted every record of the batch is failed.

use std::collections::HashMap;
use std::pin::pin;

use backoff::strategy::exponential::Exponential;
use futures::Stream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::Error;
use crate::Result;
use crate::config::{BatchConfig, RetryConfig};
use crate::health::{HealthIssue, HealthReporter};
use crate::message::{Delivery, ProcessedRecord, RecordId};
use crate::metrics::{pipeline_metrics, sink_labels};
use crate::tracker::Trackers;

/// [blackhole::BlackholeSink] accepts everything and writes nothing.
pub mod blackhole;

/// [event_log::EventLogSink] appends to the producer side of an event log.
pub mod event_log;

/// [jsonl::JsonLinesSink] appends codec encoded records to a file, one per line.
pub mod jsonl;

/// [log::LogSink] logs every record.
pub mod log;

/// Outcome of one record within a sink call.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkStatus {
    Success,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkResponse {
    pub id: RecordId,
    pub status: SinkStatus,
}

impl SinkResponse {
    pub fn success(id: RecordId) -> Self {
        Self {
            id,
            status: SinkStatus::Success,
        }
    }

    pub fn failed(id: RecordId, reason: impl Into<String>) -> Self {
        Self {
            id,
            status: SinkStatus::Failed(reason.into()),
        }
    }
}

/// A durable destination for processed records.
#[trait_variant::make(Sink: Send)]
pub trait LocalSink {
    /// Used as the metrics label.
    fn name(&self) -> &'static str;

    /// Whether a response may mix successes and failures that are then acted on per record.
    fn supports_partial_ack(&self) -> bool;

    /// Writes the batch and answers for every record in it. `Err` means the call as a whole
    /// failed and nothing can be assumed about any record.
    async fn append(&mut self, batch: &[ProcessedRecord]) -> Result<Vec<SinkResponse>>;
}

/// Receiver of per record outcomes.
#[trait_variant::make(Completion: Send)]
pub trait LocalCompletion {
    async fn ack(&self, id: RecordId) -> Result<()>;

    async fn fail(&self, id: RecordId, attempt: u32, reason: String) -> Result<()>;
}

impl Completion for Trackers {
    async fn ack(&self, id: RecordId) -> Result<()> {
        Trackers::ack(self, id).await
    }

    async fn fail(&self, id: RecordId, attempt: u32, reason: String) -> Result<()> {
        Trackers::fail(self, id, attempt, reason).await
    }
}

pub struct SinkWriter<S, C> {
    sink: S,
    completion: C,
    batch: BatchConfig,
    retry: RetryConfig,
    health: HealthReporter,
    // set while the sink keeps failing past its retries.
    unavailable: bool,
}

impl<S, C> SinkWriter<S, C>
where
    S: Sink + Send + 'static,
    C: Completion + Send + Sync + 'static,
{
    pub fn new(
        sink: S,
        completion: C,
        batch: BatchConfig,
        retry: RetryConfig,
        health: HealthReporter,
    ) -> Self {
        Self {
            sink,
            completion,
            batch,
            retry,
            health,
            unavailable: false,
        }
    }

    /// Writes one batch and reports the outcome of every record in it. Errors only come from
    /// reporting, the sink's own failures end up as record failures.
    pub async fn write(&mut self, batch: Vec<Delivery<ProcessedRecord>>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let records: Vec<ProcessedRecord> = batch.iter().map(|d| d.item.clone()).collect();
        let attempts: HashMap<RecordId, u32> =
            batch.iter().map(|d| (d.item.id, d.attempt)).collect();

        let mut backoff = self.batch_backoff();
        let mut retry_attempt = 0;
        let statuses = loop {
            let outcome = self.append_timed(&records).await;
            let retry_reason = match outcome {
                Ok(mut statuses) => {
                    let all_succeeded = statuses
                        .values()
                        .all(|status| *status == SinkStatus::Success);
                    if all_succeeded || self.sink.supports_partial_ack() {
                        self.mark_available();
                        break statuses;
                    }
                    let failed = statuses
                        .values()
                        .filter(|status| **status != SinkStatus::Success)
                        .count();
                    if backoff.is_exhausted() {
                        // out of retries, the whole batch fails with whatever each record got.
                        for status in statuses.values_mut() {
                            if *status == SinkStatus::Success {
                                *status = SinkStatus::Failed(
                                    "batch failed after retries exhausted".into(),
                                );
                            }
                        }
                        break statuses;
                    }
                    format!("{failed} records of the batch failed")
                }
                Err(e @ Error::SinkUnavailable(_)) => {
                    if backoff.is_exhausted() {
                        error!(sink = self.sink.name(), ?e, "Sink unavailable, retries exhausted");
                        self.mark_unavailable();
                        break Self::fail_all(&records, &e.to_string());
                    }
                    e.to_string()
                }
                Err(e) => {
                    error!(sink = self.sink.name(), ?e, "Sink failed the batch");
                    break Self::fail_all(&records, &e.to_string());
                }
            };

            match backoff.next() {
                Some(delay) => {
                    retry_attempt += 1;
                    warn!(sink = self.sink.name(), retry_attempt, reason = %retry_reason, "Retrying batch");
                    tokio::time::sleep(delay).await;
                }
                None => break Self::fail_all(&records, &retry_reason),
            }
        };

        Self::complete(&self.completion, self.sink.name(), &records, statuses, &attempts).await
    }

    /// Sends one call to the sink and lines the responses up with the records. A record the
    /// sink did not answer for counts as failed.
    async fn append_timed(
        &mut self,
        records: &[ProcessedRecord],
    ) -> Result<HashMap<RecordId, SinkStatus>> {
        let start = Instant::now();
        let responses = self.sink.append(records).await;
        pipeline_metrics()
            .sink
            .time
            .get_or_create(&sink_labels(self.sink.name()))
            .observe(start.elapsed().as_micros() as f64);

        let mut statuses: HashMap<RecordId, SinkStatus> = responses?
            .into_iter()
            .map(|response| (response.id, response.status))
            .collect();
        for record in records {
            statuses
                .entry(record.id)
                .or_insert_with(|| SinkStatus::Failed("no response from sink".into()));
        }
        Ok(statuses)
    }

    fn fail_all(records: &[ProcessedRecord], reason: &str) -> HashMap<RecordId, SinkStatus> {
        records
            .iter()
            .map(|record| (record.id, SinkStatus::Failed(reason.to_string())))
            .collect()
    }

    async fn complete(
        completion: &C,
        sink_name: &'static str,
        records: &[ProcessedRecord],
        mut statuses: HashMap<RecordId, SinkStatus>,
        attempts: &HashMap<RecordId, u32>,
    ) -> Result<()> {
        let labels = sink_labels(sink_name);
        for record in records {
            let Some(status) = statuses.remove(&record.id) else {
                continue;
            };
            let attempt = attempts.get(&record.id).copied().unwrap_or_default();
            match status {
                SinkStatus::Success => {
                    pipeline_metrics().sink.write_total.get_or_create(&labels).inc();
                    completion.ack(record.id).await?;
                }
                SinkStatus::Failed(reason) => {
                    pipeline_metrics().sink.failed_total.get_or_create(&labels).inc();
                    completion.fail(record.id, attempt, reason).await?;
                }
            }
        }
        Ok(())
    }

    fn batch_backoff(&self) -> Exponential {
        self.retry.backoff_with_attempts(self.batch.max_batch_retries)
    }

    fn mark_available(&mut self) {
        if self.unavailable {
            self.unavailable = false;
            self.health.clear(&HealthIssue::SinkUnavailable);
        }
    }

    fn mark_unavailable(&mut self) {
        if !self.unavailable {
            self.unavailable = true;
            self.health.raise(HealthIssue::SinkUnavailable);
        }
    }

    /// Writes batches of up to `max_batch_size` records, flushing a partial batch after
    /// `max_batch_linger`, until the input ends.
    pub fn streaming_write<St>(mut self, input: St) -> JoinHandle<Result<()>>
    where
        St: Stream<Item = Delivery<ProcessedRecord>> + Send + 'static,
    {
        tokio::spawn(async move {
            info!(
                sink = self.sink.name(),
                batch_size = self.batch.max_batch_size,
                linger = ?self.batch.max_batch_linger,
                "Starting sink writer"
            );
            let batches = input.chunks_timeout(self.batch.max_batch_size, self.batch.max_batch_linger);
            let mut batches = pin!(batches);

            while let Some(batch) = batches.next().await {
                if let Err(e) = self.write(batch).await {
                    // the trackers are gone, nothing can be acked any more.
                    error!(?e, "Reporting sink results failed, stopping sink writer");
                    return Err(e);
                }
            }
            info!(sink = self.sink.name(), "Sink writer stopped");
            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::collections::{HashSet, VecDeque};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Completions collected for assertions.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct RecordingCompletion {
        pub(crate) acked: Arc<Mutex<Vec<RecordId>>>,
        pub(crate) failed: Arc<Mutex<Vec<(RecordId, u32, String)>>>,
    }

    impl Completion for RecordingCompletion {
        async fn ack(&self, id: RecordId) -> Result<()> {
            self.acked.lock().push(id);
            Ok(())
        }

        async fn fail(&self, id: RecordId, attempt: u32, reason: String) -> Result<()> {
            self.failed.lock().push((id, attempt, reason));
            Ok(())
        }
    }

    /// A sink failing chosen offsets on every call, and whole calls while `outages` lasts.
    #[derive(Debug, Clone)]
    pub(crate) struct ScriptedSink {
        pub(crate) partial_ack: bool,
        pub(crate) failing_offsets: HashSet<u64>,
        pub(crate) outages: Arc<Mutex<VecDeque<()>>>,
        pub(crate) calls: Arc<Mutex<Vec<Vec<RecordId>>>>,
    }

    impl ScriptedSink {
        pub(crate) fn new(partial_ack: bool, failing_offsets: impl IntoIterator<Item = u64>) -> Self {
            Self {
                partial_ack,
                failing_offsets: failing_offsets.into_iter().collect(),
                outages: Arc::new(Mutex::new(VecDeque::new())),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn with_outages(self, count: usize) -> Self {
            self.outages.lock().extend(std::iter::repeat_n((), count));
            self
        }
    }

    impl Sink for ScriptedSink {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn supports_partial_ack(&self) -> bool {
            self.partial_ack
        }

        async fn append(&mut self, batch: &[ProcessedRecord]) -> Result<Vec<SinkResponse>> {
            self.calls
                .lock()
                .push(batch.iter().map(|record| record.id).collect());
            if self.outages.lock().pop_front().is_some() {
                return Err(Error::SinkUnavailable("store offline".into()));
            }
            Ok(batch
                .iter()
                .map(|record| {
                    if self.failing_offsets.contains(&record.id.offset) {
                        SinkResponse::failed(record.id, "rejected")
                    } else {
                        SinkResponse::success(record.id)
                    }
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    use super::test_utils::{RecordingCompletion, ScriptedSink};
    use super::*;
    use crate::message::Record;

    fn deliveries(offsets: impl IntoIterator<Item = u64>) -> Vec<Delivery<ProcessedRecord>> {
        offsets
            .into_iter()
            .map(|offset| {
                Delivery::first(ProcessedRecord::passthrough(&Record::new(0, offset, "x")))
            })
            .collect()
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            factor: 2.0,
            jitter: 0.0,
            max_attempts: 10,
        }
    }

    fn batch(max_batch_retries: u32) -> BatchConfig {
        BatchConfig {
            max_batch_size: 5,
            max_batch_linger: Duration::from_millis(20),
            max_batch_retries,
        }
    }

    fn acked_offsets(completion: &RecordingCompletion) -> Vec<u64> {
        let mut offsets: Vec<_> = completion.acked.lock().iter().map(|id| id.offset).collect();
        offsets.sort_unstable();
        offsets
    }

    #[tokio::test]
    async fn test_partial_ack_acks_successes_and_fails_the_rest() {
        let sink = ScriptedSink::new(true, [3]);
        let completion = RecordingCompletion::default();
        let mut writer = SinkWriter::new(
            sink.clone(),
            completion.clone(),
            batch(3),
            retry(),
            HealthReporter::new(),
        );

        writer.write(deliveries(1..=5)).await.unwrap();

        assert_eq!(acked_offsets(&completion), vec![1, 2, 4, 5]);
        let failed = completion.failed.lock().clone();
        assert_eq!(failed, vec![(RecordId::new(0, 3), 0, "rejected".to_string())]);
        assert_eq!(sink.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_whole_batch_retried_then_failed_without_partial_ack() {
        let sink = ScriptedSink::new(false, [2]);
        let completion = RecordingCompletion::default();
        let mut writer = SinkWriter::new(
            sink.clone(),
            completion.clone(),
            batch(2),
            retry(),
            HealthReporter::new(),
        );

        writer.write(deliveries(0..4)).await.unwrap();

        // first call plus two retries, always the full batch.
        let calls = sink.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|call| call.len() == 4));
        assert!(completion.acked.lock().is_empty());
        assert_eq!(completion.failed.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_outage_is_retried_and_recovers() {
        let sink = ScriptedSink::new(false, []).with_outages(2);
        let completion = RecordingCompletion::default();
        let health = HealthReporter::new();
        let mut writer = SinkWriter::new(
            sink.clone(),
            completion.clone(),
            batch(3),
            retry(),
            health.clone(),
        );

        writer.write(deliveries(0..3)).await.unwrap();
        assert_eq!(acked_offsets(&completion), vec![0, 1, 2]);
        assert_eq!(sink.calls.lock().len(), 3);
        assert!(health.status().is_healthy());
    }

    #[tokio::test]
    async fn test_persistent_outage_fails_batch_and_raises_health() {
        let sink = ScriptedSink::new(true, []).with_outages(10);
        let completion = RecordingCompletion::default();
        let health = HealthReporter::new();
        let mut writer = SinkWriter::new(
            sink.clone(),
            completion.clone(),
            batch(1),
            retry(),
            health.clone(),
        );

        writer.write(deliveries([7, 8])).await.unwrap();
        assert_eq!(completion.failed.lock().len(), 2);
        assert!(
            health
                .status()
                .issues
                .contains(&HealthIssue::SinkUnavailable)
        );

        // the next successful call clears it.
        sink.outages.lock().clear();
        writer.write(deliveries([9])).await.unwrap();
        assert!(health.status().is_healthy());
    }

    #[tokio::test]
    async fn test_streaming_write_batches_by_size_and_linger() {
        let sink = ScriptedSink::new(true, []);
        let completion = RecordingCompletion::default();
        let writer = SinkWriter::new(
            sink.clone(),
            completion.clone(),
            batch(1),
            retry(),
            HealthReporter::new(),
        );

        let (tx, rx) = mpsc::channel(16);
        for delivery in deliveries(0..7) {
            tx.send(delivery).await.unwrap();
        }
        let handle = writer.streaming_write(ReceiverStream::new(rx));
        drop(tx);
        handle.await.unwrap().unwrap();

        let calls = sink.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].len(), 5);
        assert_eq!(calls[1].len(), 2);
        assert_eq!(acked_offsets(&completion), (0..7).collect::<Vec<_>>());
    }
}
