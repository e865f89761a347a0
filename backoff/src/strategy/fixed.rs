use std::time::Duration;

/// Yields the same delay forever. Bound it with [`Iterator::take`].
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    delay: Duration,
}

impl Interval {
    pub fn from_millis(millis: u64) -> Self {
        Self {
            delay: Duration::from_millis(millis),
        }
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_constant_delay() {
        let delays: Vec<_> = Interval::from_millis(5).take(3).collect();
        assert_eq!(delays, vec![Duration::from_millis(5); 3]);
    }
}
