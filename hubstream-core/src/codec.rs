//! The serialization boundary between the pipeline and anything outside of it. Sinks that
//! persist whole records encode them with a [Codec]; the default [JsonCodec] writes a
//! self-describing JSON envelope with the payload base64 encoded so arbitrary bytes survive.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;
use crate::message::{PartitionId, Record};

pub trait Codec: Send + Sync {
    fn encode(&self, record: &Record) -> Result<Bytes>;

    fn decode(&self, bytes: &[u8]) -> Result<Record>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    partition: PartitionId,
    offset: u64,
    enqueued_time: DateTime<Utc>,
    body: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    properties: HashMap<String, String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, record: &Record) -> Result<Bytes> {
        let envelope = Envelope {
            partition: record.partition,
            offset: record.offset,
            enqueued_time: record.enqueue_time,
            body: BASE64_STANDARD.encode(&record.payload),
            properties: record.properties.as_ref().clone(),
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(format!("encoding record {}: {e}", record.id())))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Record> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| Error::Codec(format!("invalid envelope: {e}")))?;
        let payload = BASE64_STANDARD.decode(&envelope.body).map_err(|e| {
            Error::Codec(format!(
                "body of {}-{} is not base64: {e}",
                envelope.partition, envelope.offset
            ))
        })?;
        Ok(Record {
            partition: envelope.partition,
            offset: envelope.offset,
            enqueue_time: envelope.enqueued_time,
            payload: Bytes::from(payload),
            properties: Arc::new(envelope.properties),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let mut record = Record::new(2, 17, &b"\x00\xffdata"[..]);
        Arc::make_mut(&mut record.properties).insert("source".into(), "device".into());

        let encoded = JsonCodec.encode(&record).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["partition"], 2);
        assert_eq!(value["offset"], 17);
        assert_eq!(value["body"], BASE64_STANDARD.encode(b"\x00\xffdata"));
        assert_eq!(value["properties"]["source"], "device");
        assert!(value["enqueuedTime"].is_string());

        assert_eq!(JsonCodec.decode(&encoded).unwrap(), record);
    }

    #[test]
    fn test_decode_without_properties() {
        let json = br#"{"partition":0,"offset":3,"enqueuedTime":"2024-05-01T10:00:00Z","body":"aGk="}"#;
        let record = JsonCodec.decode(json).unwrap();
        assert_eq!(record.offset, 3);
        assert_eq!(record.payload.as_ref(), b"hi");
        assert!(record.properties.is_empty());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(JsonCodec.decode(b"{"), Err(Error::Codec(_))));
        let bad_body = br#"{"partition":0,"offset":3,"enqueuedTime":"2024-05-01T10:00:00Z","body":"%%"}"#;
        assert!(matches!(JsonCodec.decode(bad_body), Err(Error::Codec(_))));
    }
}
