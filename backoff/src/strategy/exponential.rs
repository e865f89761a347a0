use std::time::Duration;

use rand::Rng;

/// Delays growing as `initial * factor^(n-1)` for the n-th retry, never above `cap`.
///
/// With a non-zero `jitter` every delay is scaled by a random factor drawn from
/// `[1 - jitter, 1 + jitter]` before the cap is applied, which keeps partitions that failed at
/// the same moment from retrying in lock step.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let delays: Vec<_> = Exponential::from_millis(10, 25, 2.0, 0.0, Some(4)).collect();
/// assert_eq!(
///     delays,
///     vec![
///         Duration::from_millis(10),
///         Duration::from_millis(20),
///         Duration::from_millis(25),
///         Duration::from_millis(25),
///     ]
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    initial: Duration,
    cap: Duration,
    factor: f64,
    jitter: f64,
    /// `None` retries forever.
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Exponential {
    pub fn new(
        initial: Duration,
        cap: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial,
            cap,
            factor: factor.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_millis(
        initial_ms: u64,
        cap_ms: u64,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(cap_ms),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// Number of delays handed out since creation or the last [`Exponential::reset`].
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// True once every allowed delay has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut millis = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            millis *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }
        if !millis.is_finite() || millis >= self.cap.as_millis() as f64 {
            return self.cap;
        }
        Duration::from_millis(millis as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }
}
