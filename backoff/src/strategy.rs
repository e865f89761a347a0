//! Delay iterators consumed by [`crate::retry::Retry`].

/// Exponentially growing, capped delays with optional jitter.
pub mod exponential;

/// Constant delays, mostly useful in tests.
pub mod fixed;
