use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The event log partition could not be reached. Transient, retried with backoff.
    #[error("Source Unavailable - {0}")]
    SourceUnavailable(String),

    /// The sink rejected the whole call. Transient, retried at batch level.
    #[error("Sink Unavailable - {0}")]
    SinkUnavailable(String),

    #[error("Record Processing Error - {0}")]
    RecordProcessing(String),

    /// Checkpoints could not be persisted. Ingestion continues with degraded durability.
    #[error("Checkpoint Write Error - {0}")]
    CheckpointWrite(String),

    /// Fatal at startup.
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Codec Error - {0}")]
    Codec(String),

    #[error("Tracker Error - {0}")]
    Tracker(String),

    #[error("Flow Control Error - {0}")]
    Flow(String),

    #[error("Forwarder Error - {0}")]
    Forwarder(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl Error {
    /// Transient errors are retried in place; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable(_) | Error::SinkUnavailable(_) | Error::CheckpointWrite(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::SourceUnavailable("down".into()).is_transient());
        assert!(Error::SinkUnavailable("503".into()).is_transient());
        assert!(Error::CheckpointWrite("disk full".into()).is_transient());
        assert!(!Error::Config("missing namespace".into()).is_transient());
        assert!(!Error::RecordProcessing("bad json".into()).is_transient());
    }

    #[test]
    fn display_names_the_category() {
        assert_eq!(
            Error::Config("partitionCount must be positive".into()).to_string(),
            "Config Error - partitionCount must be positive"
        );
    }
}
