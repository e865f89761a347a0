//! A partitioned, at-least-once event pipeline.
//!
//! Records are read from every partition of an event log, processed on a bounded worker pool and
//! written to a sink in batches. Each record is tracked until the sink acknowledges it; the
//! highest offset below which everything is done is checkpointed, so a restart resumes right
//! after it. Credits bound how much of a partition can be in flight at once.
//!
//! The writer side fills an event log with synthetic device events.

pub use self::error::{Error, Result};

mod error;

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod flow;
pub mod generator;
pub mod health;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod processor;
pub mod sinker;
pub mod source;
pub mod tracker;
