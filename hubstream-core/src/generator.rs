//! Synthetic device telemetry for load generation. Every event is a small JSON document naming
//! one of `device_count` devices and a random reading; events are paced to `rate_per_sec`.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::error;

use crate::Error;
use crate::Result;
use crate::config::GeneratorConfig;
use crate::metrics::{Labels, pipeline_metrics};
use crate::source::EventData;

/// Property naming the device an event came from, set on every generated event.
pub const DEVICE_ID_PROPERTY: &str = "deviceId";

const DEVICE_VALUE_RANGE: std::ops::Range<i64> = 0..1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub device_id: u32,
    pub device_value: i64,
}

impl DeviceEvent {
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(format!("encoding device event: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Codec(format!("not a device event: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct DeviceEventGenerator {
    config: GeneratorConfig,
}

impl DeviceEventGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    /// One random event.
    pub fn next_event(&self) -> DeviceEvent {
        let mut rng = rand::rng();
        DeviceEvent {
            device_id: rng.random_range(0..self.config.device_count.max(1)),
            device_value: rng.random_range(DEVICE_VALUE_RANGE),
        }
    }

    /// The event wrapped for the producer side of the log.
    pub fn next_event_data(&self) -> Result<EventData> {
        let event = self.next_event();
        Ok(EventData::new(event.to_bytes()?)
            .with_property(DEVICE_ID_PROPERTY, event.device_id.to_string()))
    }

    fn tick(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.rate_per_sec.max(1) as f64)
    }

    /// Endless stream of events at the configured rate. Missed ticks are made up with a burst,
    /// so the long term rate holds even under scheduling delays.
    pub fn stream(self) -> Pin<Box<dyn Stream<Item = EventData> + Send>> {
        let mut interval = tokio::time::interval(self.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let stream = IntervalStream::new(interval).filter_map(move |_| {
            match self.next_event_data() {
                Ok(event) => {
                    pipeline_metrics()
                        .generated_total
                        .get_or_create(&Labels::new())
                        .inc();
                    Some(event)
                }
                Err(e) => {
                    error!(?e, "Dropping unencodable device event");
                    None
                }
            }
        });
        Box::pin(stream)
    }
}
