use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::Error;
use crate::Result;
use crate::message::{PartitionId, ProcessedRecord, RecordId};
use crate::sinker::{Sink, SinkResponse};
use crate::source::{EventData, EventLogAppender};

/// Writes records into an event log, spreading them over the partitions round robin.
pub struct EventLogSink<A> {
    log: Arc<A>,
    partitions: Vec<PartitionId>,
    next: usize,
}

impl<A> EventLogSink<A> {
    pub fn new(log: Arc<A>, partitions: Vec<PartitionId>) -> Result<Self> {
        if partitions.is_empty() {
            return Err(Error::Config(
                "event log sink needs at least one partition".into(),
            ));
        }
        Ok(Self {
            log,
            partitions,
            next: 0,
        })
    }

    fn next_partition(&mut self) -> PartitionId {
        let partition = self.partitions[self.next % self.partitions.len()];
        self.next = self.next.wrapping_add(1);
        partition
    }
}

impl<A> Sink for EventLogSink<A>
where
    A: EventLogAppender + Send + Sync,
{
    fn name(&self) -> &'static str {
        "event_log"
    }

    fn supports_partial_ack(&self) -> bool {
        true
    }

    async fn append(&mut self, batch: &[ProcessedRecord]) -> Result<Vec<SinkResponse>> {
        let mut groups: BTreeMap<PartitionId, (Vec<RecordId>, Vec<EventData>)> = BTreeMap::new();
        for record in batch {
            let (ids, events) = groups.entry(self.next_partition()).or_default();
            ids.push(record.id);
            events.push(EventData {
                payload: record.payload.clone(),
                properties: record.properties.as_ref().clone(),
            });
        }

        let group_count = groups.len();
        let mut failed_groups = 0;
        let mut last_error = None;
        let mut responses = Vec::with_capacity(batch.len());
        for (partition, (ids, events)) in groups {
            match self.log.append(partition, events).await {
                Ok(_) => responses.extend(ids.into_iter().map(SinkResponse::success)),
                Err(e) => {
                    warn!(partition, ?e, "Appending to the event log failed");
                    failed_groups += 1;
                    let reason = e.to_string();
                    responses.extend(
                        ids.into_iter()
                            .map(|id| SinkResponse::failed(id, reason.clone())),
                    );
                    last_error = Some(e);
                }
            }
        }

        if failed_groups == group_count
            && let Some(e) = last_error
        {
            return Err(Error::SinkUnavailable(e.to_string()));
        }
        Ok(responses)
    }
}
