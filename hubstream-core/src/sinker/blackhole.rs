use crate::message::ProcessedRecord;
use crate::sinker::{Sink, SinkResponse};

/// Acks every record without storing it. Useful for measuring the pipeline on its own.
pub struct BlackholeSink;

impl Sink for BlackholeSink {
    fn name(&self) -> &'static str {
        "blackhole"
    }

    fn supports_partial_ack(&self) -> bool {
        true
    }

    async fn append(&mut self, batch: &[ProcessedRecord]) -> crate::Result<Vec<SinkResponse>> {
        Ok(batch
            .iter()
            .map(|record| SinkResponse::success(record.id))
            .collect())
    }
}
