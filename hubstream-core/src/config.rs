//! Pipeline configuration. The deployment hands it over as a base64 encoded JSON object in
//! [ENV_PIPELINE_OBJ]; the JSON shape is [PipelineSpec] (camelCase, every field optional except
//! the connections) and it is turned into a validated [PipelineConfig] with defaults applied.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::Error;
use crate::Result;

pub const ENV_PIPELINE_OBJ: &str = "HUBSTREAM_PIPELINE_OBJECT";

const DEFAULT_PIPELINE_NAME: &str = "hubstream";
const DEFAULT_PARTITION_COUNT: u16 = 4;
const DEFAULT_MAX_PENDING_PER_PARTITION: usize = 1024;
const DEFAULT_ACK_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_MAX_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_BATCH_LINGER_MS: u64 = 1_000;
const DEFAULT_MAX_BATCH_RETRIES: u32 = 5;
const DEFAULT_RETRY_INITIAL_INTERVAL_MS: u64 = 10;
const DEFAULT_RETRY_MAX_INTERVAL_MS: u64 = 5_000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_RETRY_JITTER: f64 = 0.2;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_GENERATOR_RATE_PER_SEC: u64 = 100;
const DEFAULT_GENERATOR_DEVICE_COUNT: u32 = 10;
const DEFAULT_FQDN_SUFFIX: &str = "servicebus.windows.net";

/// Process wide configuration, loaded once from the environment.
pub fn config() -> Result<&'static PipelineConfig> {
    static CONF: OnceLock<PipelineConfig> = OnceLock::new();
    if let Some(conf) = CONF.get() {
        return Ok(conf);
    }
    let loaded = PipelineConfig::from_env()?;
    Ok(CONF.get_or_init(|| loaded))
}

/// Connection to an event-hub style entity: a shared access policy scoped to an entity of a
/// namespace.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub policy_name: String,
    pub policy_key: String,
    pub namespace: String,
    pub entity_path: String,
    pub fqdn_suffix: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            policy_name: String::new(),
            policy_key: String::new(),
            namespace: String::new(),
            entity_path: String::new(),
            fqdn_suffix: DEFAULT_FQDN_SUFFIX.to_string(),
        }
    }
}

// the policy key never ends up in logs.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("policy_name", &self.policy_name)
            .field("policy_key", &"<redacted>")
            .field("namespace", &self.namespace)
            .field("entity_path", &self.entity_path)
            .field("fqdn_suffix", &self.fqdn_suffix)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn endpoint(&self) -> String {
        format!("sb://{}.{}/", self.namespace, self.fqdn_suffix)
    }

    pub fn connection_string(&self) -> String {
        format!(
            "Endpoint={};SharedAccessKeyName={};SharedAccessKey={};EntityPath={}",
            self.endpoint(),
            self.policy_name,
            self.policy_key,
            self.entity_path
        )
    }

    fn validate(&self, which: &str) -> Result<()> {
        let missing: Vec<&str> = [
            ("policyName", &self.policy_name),
            ("policyKey", &self.policy_key),
            ("namespace", &self.namespace),
            ("entityPath", &self.entity_path),
            ("fqdnSuffix", &self.fqdn_suffix),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "{which} is missing {}",
                missing.join(", ")
            )))
        }
    }
}

impl FromStr for ConnectionConfig {
    type Err = Error;

    /// Parses `Endpoint=sb://<namespace>.<suffix>/;SharedAccessKeyName=..;SharedAccessKey=..;EntityPath=..`.
    fn from_str(s: &str) -> Result<Self> {
        let mut conn = ConnectionConfig::default();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("malformed connection string segment {part:?}")))?;
            match key {
                "Endpoint" => {
                    let host = value
                        .trim_start_matches("sb://")
                        .trim_end_matches('/');
                    let (namespace, suffix) = host.split_once('.').ok_or_else(|| {
                        Error::Config(format!("endpoint {value:?} has no namespace"))
                    })?;
                    conn.namespace = namespace.to_string();
                    conn.fqdn_suffix = suffix.to_string();
                }
                "SharedAccessKeyName" => conn.policy_name = value.to_string(),
                "SharedAccessKey" => conn.policy_key = value.to_string(),
                "EntityPath" => conn.entity_path = value.to_string(),
                other => {
                    return Err(Error::Config(format!(
                        "unknown connection string key {other:?}"
                    )));
                }
            }
        }
        Ok(conn)
    }
}

/// Batching of the sink writer.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    /// a partially filled batch is flushed after this long.
    pub max_batch_linger: Duration,
    /// retries of a whole batch when the sink cannot acknowledge records individually.
    pub max_batch_retries: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_linger: Duration::from_millis(DEFAULT_MAX_BATCH_LINGER_MS),
            max_batch_retries: DEFAULT_MAX_BATCH_RETRIES,
        }
    }
}

/// Backoff applied to transient I/O failures (log reads, sink calls, checkpoint writes).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(DEFAULT_RETRY_INITIAL_INTERVAL_MS),
            max_interval: Duration::from_millis(DEFAULT_RETRY_MAX_INTERVAL_MS),
            factor: DEFAULT_RETRY_FACTOR,
            jitter: DEFAULT_RETRY_JITTER,
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
        }
    }
}

impl RetryConfig {
    /// A fresh backoff iterator allowing `max_attempts` retries.
    pub fn backoff(&self) -> Exponential {
        self.backoff_with_attempts(self.max_attempts)
    }

    pub fn backoff_with_attempts(&self, attempts: u32) -> Exponential {
        Exponential::new(
            self.initial_interval,
            self.max_interval,
            self.factor,
            self.jitter,
            Some(attempts),
        )
    }
}

/// Synthetic device events produced by the writer pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    pub rate_per_sec: u64,
    pub device_count: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: DEFAULT_GENERATOR_RATE_PER_SEC,
            device_count: DEFAULT_GENERATOR_DEVICE_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub name: String,
    pub partition_count: u16,
    /// credits per partition, see [crate::flow].
    pub max_pending_per_partition: usize,
    /// a record pending longer than this is treated as failed and redelivered.
    pub ack_timeout: Duration,
    /// redeliveries of a failing record before it is declared poison.
    pub max_retries: u32,
    /// how long a single poll waits for a record.
    pub read_timeout: Duration,
    /// size of the processing worker pool.
    pub parallelism: usize,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub source_connection: ConnectionConfig,
    pub sink_connection: ConnectionConfig,
    /// where checkpoints are kept, in memory when absent.
    pub checkpoint_dir: Option<PathBuf>,
    pub generator: GeneratorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PIPELINE_NAME.to_string(),
            partition_count: DEFAULT_PARTITION_COUNT,
            max_pending_per_partition: DEFAULT_MAX_PENDING_PER_PARTITION,
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            parallelism: DEFAULT_PARTITION_COUNT as usize,
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            source_connection: ConnectionConfig::default(),
            sink_connection: ConnectionConfig::default(),
            checkpoint_dir: None,
            generator: GeneratorConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let obj = env::var(ENV_PIPELINE_OBJ)
            .map_err(|_| Error::Config(format!("{ENV_PIPELINE_OBJ} is not set")))?;
        Self::load(obj)
    }

    /// Decodes the base64 encoded JSON [PipelineSpec] and validates it.
    pub fn load(encoded: impl AsRef<[u8]>) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| Error::Config(format!("pipeline object is not base64: {e}")))?;
        let spec: PipelineSpec = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("pipeline object is not valid: {e}")))?;
        let config = PipelineConfig::try_from(spec)?;
        config.validate()?;
        Ok(config)
    }

    /// Full startup validation, connections included.
    pub fn validate(&self) -> Result<()> {
        self.validate_limits()?;
        self.source_connection.validate("sourceConnection")?;
        self.sink_connection.validate("sinkConnection")
    }

    /// The numeric limits the pipelines cannot run without.
    pub fn validate_limits(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(Error::Config("partitionCount must be positive".into()));
        }
        if self.max_pending_per_partition == 0 {
            return Err(Error::Config(
                "maxPendingPerPartition must be positive".into(),
            ));
        }
        if self.parallelism == 0 {
            return Err(Error::Config("parallelism must be positive".into()));
        }
        if self.batch.max_batch_size == 0 {
            return Err(Error::Config("maxBatchSize must be positive".into()));
        }
        if self.ack_timeout.is_zero() {
            return Err(Error::Config("ackTimeoutMs must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config("retry jitter must be within [0, 1]".into()));
        }
        if self.generator.rate_per_sec == 0 || self.generator.device_count == 0 {
            return Err(Error::Config(
                "generator ratePerSec and deviceCount must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// JSON shape of the pipeline object.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    pub name: Option<String>,
    pub partition_count: Option<u16>,
    pub max_pending_per_partition: Option<usize>,
    pub ack_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub read_timeout_ms: Option<u64>,
    pub parallelism: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub max_batch_linger_ms: Option<u64>,
    pub max_batch_retries: Option<u32>,
    pub retry: Option<RetrySpec>,
    pub source_connection: Option<ConnectionSpec>,
    pub sink_connection: Option<ConnectionSpec>,
    pub checkpoint_dir: Option<PathBuf>,
    pub generator: Option<GeneratorSpec>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    pub initial_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub factor: Option<f64>,
    pub jitter: Option<f64>,
    pub max_attempts: Option<u32>,
}

/// Either a full connection string or the individual parts. Parts override the string.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    pub connection_string: Option<String>,
    pub policy_name: Option<String>,
    pub policy_key: Option<String>,
    pub namespace: Option<String>,
    pub entity_path: Option<String>,
    pub fqdn_suffix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorSpec {
    pub rate_per_sec: Option<u64>,
    pub device_count: Option<u32>,
}

impl TryFrom<ConnectionSpec> for ConnectionConfig {
    type Error = Error;

    fn try_from(spec: ConnectionSpec) -> Result<Self> {
        let mut conn = match spec.connection_string {
            Some(s) => s.parse()?,
            None => ConnectionConfig::default(),
        };
        if let Some(v) = spec.policy_name {
            conn.policy_name = v;
        }
        if let Some(v) = spec.policy_key {
            conn.policy_key = v;
        }
        if let Some(v) = spec.namespace {
            conn.namespace = v;
        }
        if let Some(v) = spec.entity_path {
            conn.entity_path = v;
        }
        if let Some(v) = spec.fqdn_suffix {
            conn.fqdn_suffix = v;
        }
        Ok(conn)
    }
}

impl From<RetrySpec> for RetryConfig {
    fn from(spec: RetrySpec) -> Self {
        let mut retry = RetryConfig::default();
        if let Some(ms) = spec.initial_interval_ms {
            retry.initial_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = spec.max_interval_ms {
            retry.max_interval = Duration::from_millis(ms);
        }
        if let Some(factor) = spec.factor {
            retry.factor = factor;
        }
        if let Some(jitter) = spec.jitter {
            retry.jitter = jitter;
        }
        if let Some(attempts) = spec.max_attempts {
            retry.max_attempts = attempts;
        }
        retry
    }
}

impl TryFrom<PipelineSpec> for PipelineConfig {
    type Error = Error;

    fn try_from(spec: PipelineSpec) -> Result<Self> {
        let defaults = PipelineConfig::default();
        let partition_count = spec.partition_count.unwrap_or(defaults.partition_count);

        let source_connection = spec
            .source_connection
            .ok_or_else(|| Error::Config("sourceConnection is required".into()))?
            .try_into()?;
        let sink_connection = spec
            .sink_connection
            .ok_or_else(|| Error::Config("sinkConnection is required".into()))?
            .try_into()?;

        let generator = spec.generator.map_or_else(GeneratorConfig::default, |g| {
            let mut generator = GeneratorConfig::default();
            if let Some(rate) = g.rate_per_sec {
                generator.rate_per_sec = rate;
            }
            if let Some(devices) = g.device_count {
                generator.device_count = devices;
            }
            generator
        });

        Ok(PipelineConfig {
            name: spec.name.unwrap_or(defaults.name),
            partition_count,
            max_pending_per_partition: spec
                .max_pending_per_partition
                .unwrap_or(defaults.max_pending_per_partition),
            ack_timeout: spec
                .ack_timeout_ms
                .map_or(defaults.ack_timeout, Duration::from_millis),
            max_retries: spec.max_retries.unwrap_or(defaults.max_retries),
            read_timeout: spec
                .read_timeout_ms
                .map_or(defaults.read_timeout, Duration::from_millis),
            // parallelism hint follows the partition count unless given.
            parallelism: spec.parallelism.unwrap_or(partition_count as usize),
            batch: BatchConfig {
                max_batch_size: spec.max_batch_size.unwrap_or(defaults.batch.max_batch_size),
                max_batch_linger: spec
                    .max_batch_linger_ms
                    .map_or(defaults.batch.max_batch_linger, Duration::from_millis),
                max_batch_retries: spec
                    .max_batch_retries
                    .unwrap_or(defaults.batch.max_batch_retries),
            },
            retry: spec.retry.map(RetryConfig::from).unwrap_or_default(),
            source_connection,
            sink_connection,
            checkpoint_dir: spec.checkpoint_dir,
            generator,
        })
    }
}
