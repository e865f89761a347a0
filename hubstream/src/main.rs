use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use hubstream_core::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use hubstream_core::config::{self, ENV_PIPELINE_OBJ, PipelineConfig};
use hubstream_core::health::{HealthReporter, LogErrorSink};
use hubstream_core::metrics::encode_metrics;
use hubstream_core::pipeline::ReaderPipeline;
use hubstream_core::pipeline::writer::WriterPipeline;
use hubstream_core::processor::DeviceEventProcessor;
use hubstream_core::sinker::Sink;
use hubstream_core::sinker::blackhole::BlackholeSink;
use hubstream_core::sinker::jsonl::JsonLinesSink;
use hubstream_core::sinker::log::LogSink;
use hubstream_core::source::memory::MemoryLog;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod setup_tracing;

const DEFAULT_EVENT_COUNT: usize = 1_000;

/// What to run, from the command line.
#[derive(Debug)]
struct Args {
    writer: bool,
    reader: bool,
    count: usize,
    out: Option<PathBuf>,
    discard: bool,
}

impl Args {
    fn parse(args: &[String]) -> Result<Self, Box<dyn Error>> {
        let writer_only = args.iter().any(|a| a == "--writer");
        let reader_only = args.iter().any(|a| a == "--reader");
        let count = match value_of(args, "--count") {
            Some(count) => count
                .parse()
                .map_err(|e| format!("invalid --count {count:?}: {e}"))?,
            None => DEFAULT_EVENT_COUNT,
        };
        Ok(Self {
            // neither flag runs both topologies
            writer: writer_only || !reader_only,
            reader: reader_only || !writer_only,
            count,
            out: value_of(args, "--out").map(PathBuf::from),
            discard: args.iter().any(|a| a == "--discard"),
        })
    }
}

fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    let args = Args::parse(&args)?;
    info!(?args, "Starting with args");

    let config = if env::var(ENV_PIPELINE_OBJ).is_ok() {
        config::config()?.clone()
    } else {
        warn!("{ENV_PIPELINE_OBJ} is not set, running with the default pipeline");
        PipelineConfig::default()
    };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, shutting down"),
            Err(e) => error!(?e, "Failed to listen for interrupts, shutting down"),
        }
        shutdown.cancel();
    });

    let health = HealthReporter::new();
    let log = Arc::new(MemoryLog::new(config.partition_count));

    if args.writer {
        let report = WriterPipeline::new(config.clone(), Arc::clone(&log))
            .with_limit(args.count)
            .with_health(health.clone())
            .run(cancel.clone())
            .await?;
        info!(
            appended = report.appended,
            dropped = report.dropped,
            "Writer pipeline finished"
        );
    }

    if args.reader && !cancel.is_cancelled() {
        let store: Arc<dyn CheckpointStore> = match &config.checkpoint_dir {
            Some(dir) => Arc::new(FileCheckpointStore::new(dir).await?),
            None => Arc::new(MemoryCheckpointStore::new()),
        };
        match &args.out {
            Some(path) => {
                let sink = JsonLinesSink::open(path).await?;
                run_reader(config, log, sink, store, health.clone(), cancel).await?;
            }
            None if args.discard => {
                run_reader(config, log, BlackholeSink, store, health.clone(), cancel).await?
            }
            None => run_reader(config, log, LogSink, store, health.clone(), cancel).await?,
        }
    }

    info!(status = ?health.status(), "Final health");
    debug!(metrics = %encode_metrics()?, "Final metrics");
    Ok(())
}

async fn run_reader<S: Sink + Send + 'static>(
    config: PipelineConfig,
    log: Arc<MemoryLog>,
    sink: S,
    store: Arc<dyn CheckpointStore>,
    health: HealthReporter,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    info!("Reader pipeline running, interrupt to stop");
    let report = ReaderPipeline::new(config, log, DeviceEventProcessor, sink, store)
        .with_error_sink(Arc::new(LogErrorSink))
        .with_health(health)
        .run(cancel)
        .await?;
    info!(checkpoints = ?report.checkpoints, "Reader pipeline finished");
    Ok(())
}
