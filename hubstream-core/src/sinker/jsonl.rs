//! Appends every record as one line of codec output to a local file. It plays the part of a
//! table store: durable, append only, and inspectable after the fact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::warn;

use crate::Error;
use crate::Result;
use crate::codec::{Codec, JsonCodec};
use crate::message::ProcessedRecord;
use crate::sinker::{Sink, SinkResponse};

pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
    codec: Arc<dyn Codec>,
}

impl JsonLinesSink {
    /// Opens `path` for appending with the [JsonCodec], creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_codec(path, Arc::new(JsonCodec)).await
    }

    pub async fn open_with_codec(path: impl AsRef<Path>, codec: Arc<dyn Codec>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Config(format!("opening sink file {}: {e}", path.display())))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            codec,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn unavailable(path: &Path, e: std::io::Error) -> Error {
    Error::SinkUnavailable(format!("writing {}: {e}", path.display()))
}

impl Sink for JsonLinesSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn supports_partial_ack(&self) -> bool {
        true
    }

    async fn append(&mut self, batch: &[ProcessedRecord]) -> Result<Vec<SinkResponse>> {
        let mut responses = Vec::with_capacity(batch.len());
        let mut lines = Vec::new();
        for record in batch {
            match self.codec.encode(&record.to_record()) {
                Ok(encoded) => {
                    lines.extend_from_slice(&encoded);
                    lines.push(b'\n');
                    responses.push(SinkResponse::success(record.id));
                }
                Err(e) => {
                    warn!(id = %record.id, ?e, "Record cannot be encoded");
                    responses.push(SinkResponse::failed(record.id, e.to_string()));
                }
            }
        }

        if !lines.is_empty() {
            let path = &self.path;
            self.writer
                .write_all(&lines)
                .await
                .map_err(|e| unavailable(path, e))?;
            self.writer
                .flush()
                .await
                .map_err(|e| unavailable(path, e))?;
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::Record;
    use crate::sinker::SinkStatus;

    /// Refuses payloads starting with `!`.
    struct PickyCodec;

    impl Codec for PickyCodec {
        fn encode(&self, record: &Record) -> Result<Bytes> {
            if record.payload.starts_with(b"!") {
                return Err(Error::Codec("picky".into()));
            }
            JsonCodec.encode(record)
        }

        fn decode(&self, bytes: &[u8]) -> Result<Record> {
            JsonCodec.decode(bytes)
        }
    }

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut sink = JsonLinesSink::open(&path).await.unwrap();

        let batch: Vec<_> = (0..3)
            .map(|offset| ProcessedRecord::passthrough(&Record::new(1, offset, format!("v{offset}"))))
            .collect();
        sink.append(&batch).await.unwrap();
        sink.append(&batch[..1]).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let decoded: Vec<Record> = content
            .lines()
            .map(|line| JsonCodec.decode(line.as_bytes()).unwrap())
            .collect();
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[2].payload.as_ref(), b"v2");
        assert_eq!(decoded[3].offset, 0);
    }

    #[tokio::test]
    async fn test_encoding_failure_is_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut sink = JsonLinesSink::open_with_codec(&path, Arc::new(PickyCodec))
            .await
            .unwrap();

        let batch = vec![
            ProcessedRecord::passthrough(&Record::new(0, 0, "fine")),
            ProcessedRecord::passthrough(&Record::new(0, 1, "!nope")),
        ];
        let responses = sink.append(&batch).await.unwrap();
        assert_eq!(responses[0].status, SinkStatus::Success);
        assert!(matches!(responses[1].status, SinkStatus::Failed(_)));

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
