//! Generated device events are batched and appended to the event log, spread over its
//! partitions round robin. Nothing upstream can replay a generated event, so an event the log
//! keeps refusing is counted and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Error;
use crate::Result;
use crate::config::PipelineConfig;
use crate::generator::DeviceEventGenerator;
use crate::health::HealthReporter;
use crate::message::{Delivery, PartitionId, ProcessedRecord, RecordId};
use crate::sinker::event_log::EventLogSink;
use crate::sinker::{Completion, SinkWriter};
use crate::source::EventLogAppender;

/// Counts of a writer pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub appended: u64,
    pub dropped: u64,
}

#[derive(Debug, Default, Clone)]
struct WriterCompletion {
    appended: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl Completion for WriterCompletion {
    async fn ack(&self, _id: RecordId) -> Result<()> {
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn fail(&self, id: RecordId, _attempt: u32, reason: String) -> Result<()> {
        error!(sequence = id.offset, %reason, "Dropping generated event");
        self.dropped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub struct WriterPipeline<A> {
    config: PipelineConfig,
    log: Arc<A>,
    partitions: Vec<PartitionId>,
    limit: Option<usize>,
    health: HealthReporter,
}

impl<A> WriterPipeline<A>
where
    A: EventLogAppender + Send + Sync + 'static,
{
    /// Writes to partitions `0..partition_count` of `log`.
    pub fn new(config: PipelineConfig, log: Arc<A>) -> Self {
        let partitions = (0..config.partition_count).collect();
        Self {
            config,
            log,
            partitions,
            limit: None,
            health: HealthReporter::new(),
        }
    }

    /// Stops after `limit` events instead of running until cancelled.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_health(mut self, health: HealthReporter) -> Self {
        self.health = health;
        self
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<WriterReport> {
        self.config.validate_limits()?;
        let sink = EventLogSink::new(self.log, self.partitions)?;
        let completion = WriterCompletion::default();

        // generated events carry their sequence number where a read record has its offset.
        let mut sequence = 0u64;
        let events = DeviceEventGenerator::new(self.config.generator.clone())
            .stream()
            .take_until(cancel.cancelled_owned())
            .take(self.limit.unwrap_or(usize::MAX))
            .map(move |event| {
                let record = ProcessedRecord {
                    id: RecordId::new(0, sequence),
                    enqueue_time: Utc::now(),
                    payload: event.payload,
                    properties: Arc::new(event.properties),
                };
                sequence += 1;
                Delivery::first(record)
            });

        info!(
            rate = self.config.generator.rate_per_sec,
            devices = self.config.generator.device_count,
            limit = ?self.limit,
            "Writer pipeline started"
        );
        let writer = SinkWriter::new(
            sink,
            completion.clone(),
            self.config.batch.clone(),
            self.config.retry.clone(),
            self.health,
        );
        writer
            .streaming_write(events)
            .await
            .map_err(|e| Error::Forwarder(format!("writer task failed: {e}")))??;

        let report = WriterReport {
            appended: completion.appended.load(Ordering::Relaxed),
            dropped: completion.dropped.load(Ordering::Relaxed),
        };
        info!(?report, "Writer pipeline stopped");
        Ok(report)
    }
}
