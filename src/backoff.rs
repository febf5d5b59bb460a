use std::time::Duration;

/// A bounded exponential backoff schedule: base * 2^attempt, capped at max,
/// for up to retries attempts. Used by every reconnect path (LFD → server,
/// server → RM, client → replica). Yields the delay to sleep before each
/// attempt; exhaustion of the iterator is the caller's signal to give up.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    retries: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, retries: u32) -> Self {
        Self { base, max, retries, attempt: 0 }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.retries {
            return None;
        }
        // Cap the shift such that the multiplier can't overflow; the delay
        // is clamped to max well before that anyway.
        let factor = 1u32 << self.attempt.min(20);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);
        self.attempt += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn doubles_and_caps() {
        let secs: Vec<u64> =
            Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 6)
                .map(|d| d.as_secs())
                .collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn ends_after_retries() {
        assert_eq!(Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0).count(), 0);
        assert_eq!(Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 3).count(), 3);
    }

    #[test]
    fn large_attempt_does_not_overflow() {
        let delays: Vec<Duration> =
            Backoff::new(Duration::from_secs(3600), Duration::from_secs(7200), 40).collect();
        assert_eq!(delays.len(), 40);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(7200)));
    }
}
