use tracing::info;

use crate::Result;
use crate::message::ProcessedRecord;
use crate::sinker::{Sink, SinkResponse};

pub struct LogSink;

impl Sink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn supports_partial_ack(&self) -> bool {
        true
    }

    async fn append(&mut self, batch: &[ProcessedRecord]) -> Result<Vec<SinkResponse>> {
        let mut result = Vec::with_capacity(batch.len());
        for record in batch {
            let mut properties = String::new();
            record.properties.iter().for_each(|(k, v)| {
                properties.push_str(&format!("{k}: {v}, "));
            });

            info!(
                "Payload - {} EnqueueTime - {} Properties - {} ID - {}",
                String::from_utf8_lossy(&record.payload),
                record.enqueue_time.timestamp_millis(),
                properties,
                record.id,
            );
            result.push(SinkResponse::success(record.id));
        }
        Ok(result)
    }
}
