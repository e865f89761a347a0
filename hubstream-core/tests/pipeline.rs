use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use hubstream_core::Result;
use hubstream_core::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use hubstream_core::config::{BatchConfig, PipelineConfig, RetryConfig};
use hubstream_core::health::{HealthReporter, MemoryErrorSink};
use hubstream_core::message::{ProcessedRecord, Record, RecordId};
use hubstream_core::pipeline::writer::WriterPipeline;
use hubstream_core::pipeline::{PipelineReport, ReaderPipeline};
use hubstream_core::processor::{DeviceEventProcessor, Passthrough, ProcessError, Processor};
use hubstream_core::sinker::jsonl::JsonLinesSink;
use hubstream_core::sinker::{Sink, SinkResponse};
use hubstream_core::source::memory::MemoryLog;
use hubstream_core::source::{EventData, EventLogAppender};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Keeps every record it accepted. Offsets in `fail_once` are rejected on their first
/// appearance only, offsets in `rejecting` every time.
#[derive(Clone, Default)]
struct CollectingSink {
    written: Arc<Mutex<Vec<RecordId>>>,
    fail_once: Arc<Mutex<HashSet<u64>>>,
    rejecting: Arc<Mutex<HashSet<u64>>>,
    calls: Arc<Mutex<Vec<Vec<RecordId>>>>,
}

impl CollectingSink {
    fn failing_once(offsets: impl IntoIterator<Item = u64>) -> Self {
        let sink = Self::default();
        sink.fail_once.lock().extend(offsets);
        sink
    }

    fn rejecting(offsets: impl IntoIterator<Item = u64>) -> Self {
        let sink = Self::default();
        sink.rejecting.lock().extend(offsets);
        sink
    }

    fn sent(&self, offset: u64) -> usize {
        self.calls
            .lock()
            .iter()
            .flatten()
            .filter(|id| id.offset == offset)
            .count()
    }

    fn written(&self) -> Vec<RecordId> {
        self.written.lock().clone()
    }
}

impl Sink for CollectingSink {
    fn name(&self) -> &'static str {
        "collecting"
    }

    fn supports_partial_ack(&self) -> bool {
        true
    }

    async fn append(&mut self, batch: &[ProcessedRecord]) -> Result<Vec<SinkResponse>> {
        self.calls
            .lock()
            .push(batch.iter().map(|record| record.id).collect());
        let mut responses = Vec::with_capacity(batch.len());
        for record in batch {
            let offset = record.id.offset;
            if self.fail_once.lock().remove(&offset) || self.rejecting.lock().contains(&offset) {
                responses.push(SinkResponse::failed(record.id, "transient rejection"));
            } else {
                self.written.lock().push(record.id);
                responses.push(SinkResponse::success(record.id));
            }
        }
        Ok(responses)
    }
}

fn config(partition_count: u16) -> PipelineConfig {
    PipelineConfig {
        partition_count,
        max_pending_per_partition: 8,
        ack_timeout: Duration::from_secs(10),
        max_retries: 2,
        read_timeout: Duration::from_millis(20),
        parallelism: 2,
        batch: BatchConfig {
            max_batch_size: 5,
            max_batch_linger: Duration::from_millis(20),
            max_batch_retries: 2,
        },
        retry: RetryConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
            max_attempts: 3,
        },
        ..Default::default()
    }
}

async fn fill(log: &MemoryLog, partition: u16, payloads: impl IntoIterator<Item = String>) {
    let events = payloads.into_iter().map(EventData::new).collect();
    log.append(partition, events).await.unwrap();
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Runs the reader pipeline until `done` holds, then shuts it down.
async fn run_until<P: Processor>(
    pipeline: ReaderPipeline<MemoryLog, P, CollectingSink>,
    done: impl Fn() -> bool,
) -> PipelineReport {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pipeline.run(cancel.clone()));
    eventually("the pipeline to catch up", done).await;
    cancel.cancel();
    handle.await.unwrap().unwrap()
}

#[tokio::test]
async fn test_restart_resumes_after_checkpoint() {
    let log = Arc::new(MemoryLog::new(2));
    for partition in 0..2 {
        fill(&log, partition, (0..10).map(|i| format!("first-{i}"))).await;
    }
    let store = Arc::new(MemoryCheckpointStore::new());

    let sink = CollectingSink::default();
    let pipeline = ReaderPipeline::new(
        config(2),
        Arc::clone(&log),
        Passthrough,
        sink.clone(),
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
    );
    let report = run_until(pipeline, || sink.written().len() == 20).await;
    assert_eq!(
        report.checkpoints,
        HashMap::from([(0, Some(9)), (1, Some(9))])
    );
    assert_eq!(store.get(0), Some(9));
    assert_eq!(store.get(1), Some(9));

    for partition in 0..2 {
        fill(&log, partition, (0..5).map(|i| format!("second-{i}"))).await;
    }
    let sink = CollectingSink::default();
    let pipeline = ReaderPipeline::new(
        config(2),
        Arc::clone(&log),
        Passthrough,
        sink.clone(),
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
    );
    let report = run_until(pipeline, || sink.written().len() == 10).await;

    let written = sink.written();
    assert!(written.iter().all(|id| id.offset >= 10), "{written:?}");
    assert_eq!(
        report.checkpoints,
        HashMap::from([(0, Some(14)), (1, Some(14))])
    );
}

#[tokio::test]
async fn test_unacked_records_come_back_after_restart() {
    let log = Arc::new(MemoryLog::new(1));
    fill(&log, 0, (0..10).map(|i| format!("r{i}"))).await;
    let store = Arc::new(MemoryCheckpointStore::new());

    // offsets 3 and 4 keep failing and never reach a terminal state.
    let mut patient = config(1);
    patient.max_retries = 10_000;
    let sink = CollectingSink::rejecting([3, 4]);
    let pipeline = ReaderPipeline::new(
        patient,
        Arc::clone(&log),
        Passthrough,
        sink.clone(),
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
    );
    let report = run_until(pipeline, || {
        sink.written().len() == 8 && sink.sent(3) >= 2 && sink.sent(4) >= 2
    })
    .await;
    assert_eq!(report.checkpoints, HashMap::from([(0, Some(2))]));
    assert_eq!(store.get(0), Some(2));

    let sink = CollectingSink::default();
    let pipeline = ReaderPipeline::new(
        config(1),
        Arc::clone(&log),
        Passthrough,
        sink.clone(),
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
    );
    let report = run_until(pipeline, || sink.written().len() == 7).await;

    // everything after the checkpoint is read again, the acked records behind 3 and 4 included.
    let mut offsets: Vec<_> = sink.written().iter().map(|id| id.offset).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, (3..10).collect::<Vec<_>>());
    assert_eq!(report.checkpoints, HashMap::from([(0, Some(9))]));
    assert_eq!(store.get(0), Some(9));
}

#[tokio::test]
async fn test_poison_record_does_not_block_progress() {
    let log = Arc::new(MemoryLog::new(1));
    fill(
        &log,
        0,
        ["ok-0", "poison", "ok-2", "ok-3"].map(String::from),
    )
    .await;

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let processor = {
        let deliveries = Arc::clone(&deliveries);
        move |record: &Record| -> std::result::Result<ProcessedRecord, ProcessError> {
            deliveries.lock().push(record.offset);
            if record.payload.as_ref() == b"poison" {
                return Err(ProcessError::new("cannot parse"));
            }
            Ok(ProcessedRecord::passthrough(record))
        }
    };

    let errors = MemoryErrorSink::new();
    let sink = CollectingSink::default();
    let pipeline = ReaderPipeline::new(
        config(1),
        Arc::clone(&log),
        processor,
        sink.clone(),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .with_error_sink(Arc::new(errors.clone()));

    let report = run_until(pipeline, || {
        sink.written().len() == 3 && errors.records().len() == 1
    })
    .await;

    let poisoned = errors.records();
    assert_eq!(poisoned[0].record.offset, 1);
    assert_eq!(poisoned[0].deliveries, 3);
    assert_eq!(poisoned[0].reason, "cannot parse");
    // the first delivery plus max_retries redeliveries.
    assert_eq!(deliveries.lock().iter().filter(|o| **o == 1).count(), 3);
    assert_eq!(report.checkpoints, HashMap::from([(0, Some(3))]));
}

#[tokio::test]
async fn test_partial_ack_failure_is_redelivered() {
    let log = Arc::new(MemoryLog::new(1));
    fill(&log, 0, (0..5).map(|i| format!("r{i}"))).await;

    let sink = CollectingSink::failing_once([3]);
    let pipeline = ReaderPipeline::new(
        config(1),
        Arc::clone(&log),
        Passthrough,
        sink.clone(),
        Arc::new(MemoryCheckpointStore::new()),
    );
    let report = run_until(pipeline, || sink.written().len() == 5).await;

    let mut offsets: Vec<_> = sink.written().iter().map(|id| id.offset).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    // offset 3 was sent twice, everything else once.
    assert_eq!(sink.sent(3), 2);
    assert_eq!(report.checkpoints, HashMap::from([(0, Some(4))]));
}

#[tokio::test]
async fn test_credits_bound_in_flight_records() {
    let log = Arc::new(MemoryLog::new(1));
    fill(&log, 0, (0..50).map(|i| format!("r{i}"))).await;

    let mut config = config(1);
    config.batch.max_batch_size = 20;
    config.batch.max_batch_linger = Duration::from_millis(50);
    let sink = CollectingSink::default();
    let pipeline = ReaderPipeline::new(
        config,
        Arc::clone(&log),
        Passthrough,
        sink.clone(),
        Arc::new(MemoryCheckpointStore::new()),
    );
    let report = run_until(pipeline, || sink.written().len() == 50).await;

    // no sink call ever carried more records than a partition may have in flight.
    assert!(sink.calls.lock().iter().all(|call| call.len() <= 8));
    assert_eq!(report.checkpoints, HashMap::from([(0, Some(49))]));
}

#[tokio::test]
async fn test_partition_count_must_match_log() {
    let log = Arc::new(MemoryLog::new(3));
    let pipeline = ReaderPipeline::new(
        config(2),
        log,
        Passthrough,
        CollectingSink::default(),
        Arc::new(MemoryCheckpointStore::new()),
    );
    let result = pipeline.run(CancellationToken::new()).await;
    assert!(matches!(result, Err(hubstream_core::Error::Config(_))));
}

#[tokio::test]
async fn test_writer_then_reader_into_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(MemoryLog::new(2));

    let mut writer_config = config(2);
    writer_config.generator.rate_per_sec = 5_000;
    let written = WriterPipeline::new(writer_config, Arc::clone(&log))
        .with_limit(40)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(written.appended, 40);

    let store = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoints")).await.unwrap());
    let sink_path = dir.path().join("rows.jsonl");
    let sink = JsonLinesSink::open(&sink_path).await.unwrap();
    let health = HealthReporter::new();
    let cancel = CancellationToken::new();
    let pipeline = ReaderPipeline::new(
        config(2),
        Arc::clone(&log),
        DeviceEventProcessor,
        sink,
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
    )
    .with_health(health.clone());
    let handle = tokio::spawn(pipeline.run(cancel.clone()));

    let path = sink_path.clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let lines = tokio::fs::read_to_string(&path)
                .await
                .map(|content| content.lines().count())
                .unwrap_or_default();
            if lines == 40 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all generated events should reach the file");
    cancel.cancel();
    let report = handle.await.unwrap().unwrap();

    let per_partition = [log.len(0) as u64, log.len(1) as u64];
    for (partition, len) in per_partition.into_iter().enumerate() {
        let partition = partition as u16;
        assert_eq!(report.checkpoints[&partition], len.checked_sub(1));
        assert_eq!(store.load(partition).await.unwrap(), len.checked_sub(1));
    }
    assert!(health.status().is_healthy());
}
