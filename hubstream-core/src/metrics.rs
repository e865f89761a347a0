//! Prometheus metrics of the pipelines. Every metric is a [Family] keyed by a label set so that
//! partitions can be told apart; all of them live in one process wide registry which can be
//! rendered in the text exposition format with [encode_metrics].

use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::Error;
use crate::Result;
use crate::message::PartitionId;

const REGISTRY_PREFIX: &str = "hubstream";
const PARTITION_LABEL: &str = "partition";

// reader side
const READ_TOTAL: &str = "read";
const READ_BYTES_TOTAL: &str = "read_bytes";
const ACK_TOTAL: &str = "ack";
const REDELIVERED_TOTAL: &str = "redelivered";
const POISON_TOTAL: &str = "poison";
const THROTTLED_TOTAL: &str = "throttled";
const CHECKPOINT_OFFSET: &str = "checkpoint_offset";
const IN_FLIGHT: &str = "in_flight";
const PROCESSING_ERRORS_TOTAL: &str = "processing_errors";

// sink side
const SINK_WRITE_TOTAL: &str = "sink_write";
const SINK_FAILED_TOTAL: &str = "sink_failed";
const SINK_WRITE_TIME: &str = "sink_write_time";

// writer pipeline
const GENERATED_TOTAL: &str = "generated";

pub type Labels = Vec<(String, String)>;

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // metrics are registered once, a blocking mutex is fine.
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::default)
}

pub struct PipelineMetrics {
    pub read_total: Family<Labels, Counter>,
    pub read_bytes_total: Family<Labels, Counter>,
    pub ack_total: Family<Labels, Counter>,
    pub redelivered_total: Family<Labels, Counter>,
    pub poison_total: Family<Labels, Counter>,
    pub throttled_total: Family<Labels, Counter>,
    pub processing_errors_total: Family<Labels, Counter>,
    pub checkpoint_offset: Family<Labels, Gauge>,
    pub in_flight: Family<Labels, Gauge>,
    pub sink: SinkMetrics,
    pub generated_total: Family<Labels, Counter>,
}

pub struct SinkMetrics {
    pub write_total: Family<Labels, Counter>,
    pub failed_total: Family<Labels, Counter>,
    /// microseconds per sink call.
    pub time: Family<Labels, Histogram>,
}

impl PipelineMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::default(),
            read_bytes_total: Family::default(),
            ack_total: Family::default(),
            redelivered_total: Family::default(),
            poison_total: Family::default(),
            throttled_total: Family::default(),
            processing_errors_total: Family::default(),
            checkpoint_offset: Family::default(),
            in_flight: Family::default(),
            sink: SinkMetrics {
                write_total: Family::default(),
                failed_total: Family::default(),
                // 100us .. ~100s
                time: Family::new_with_constructor(|| {
                    Histogram::new(exponential_buckets(100.0, 4.0, 11))
                }),
            },
            generated_total: Family::default(),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            READ_TOTAL,
            "Total number of records read from the event log",
            metrics.read_total.clone(),
        );
        registry.register(
            READ_BYTES_TOTAL,
            "Total number of payload bytes read from the event log",
            metrics.read_bytes_total.clone(),
        );
        registry.register(
            ACK_TOTAL,
            "Total number of records acknowledged",
            metrics.ack_total.clone(),
        );
        registry.register(
            REDELIVERED_TOTAL,
            "Total number of redeliveries after a failure or an ack timeout",
            metrics.redelivered_total.clone(),
        );
        registry.register(
            POISON_TOTAL,
            "Total number of records given up on after exhausting their retries",
            metrics.poison_total.clone(),
        );
        registry.register(
            THROTTLED_TOTAL,
            "Total number of polls refused for lack of credits",
            metrics.throttled_total.clone(),
        );
        registry.register(
            PROCESSING_ERRORS_TOTAL,
            "Total number of processing stage failures",
            metrics.processing_errors_total.clone(),
        );
        registry.register(
            CHECKPOINT_OFFSET,
            "Last offset handed to the checkpoint writer",
            metrics.checkpoint_offset.clone(),
        );
        registry.register(
            IN_FLIGHT,
            "Records read but not yet released",
            metrics.in_flight.clone(),
        );
        registry.register(
            SINK_WRITE_TOTAL,
            "Total number of records written to the sink",
            metrics.sink.write_total.clone(),
        );
        registry.register(
            SINK_FAILED_TOTAL,
            "Total number of records the sink failed to write",
            metrics.sink.failed_total.clone(),
        );
        registry.register(
            SINK_WRITE_TIME,
            "Time taken by a sink call in microseconds",
            metrics.sink.time.clone(),
        );
        registry.register(
            GENERATED_TOTAL,
            "Total number of synthetic events produced",
            metrics.generated_total.clone(),
        );
        metrics
    }
}

static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

pub fn pipeline_metrics() -> &'static PipelineMetrics {
    PIPELINE_METRICS.get_or_init(PipelineMetrics::new)
}

pub fn partition_labels(partition: PartitionId) -> Labels {
    vec![(PARTITION_LABEL.to_string(), partition.to_string())]
}

pub fn sink_labels(sink: &str) -> Labels {
    vec![("sink".to_string(), sink.to_string())]
}

/// Renders every registered metric in the text exposition format.
pub fn encode_metrics() -> Result<String> {
    // make sure the families exist even before the first record flows.
    pipeline_metrics();
    let mut buffer = String::new();
    let registry = global_registry().registry.lock();
    encode(&mut buffer, &registry).map_err(|e| Error::Forwarder(format!("encoding metrics: {e}")))?;
    Ok(buffer)
}
