use std::time::Duration;

/// Action to take before the next transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    /// Retry right away.
    Retry,
    /// Yield the current thread, then retry.
    Yield,
    /// Sleep, then retry.
    Sleep(Duration),
}

impl BackoffAction {
    pub(crate) fn perform(self) {
        match self {
            BackoffAction::Retry => {}
            BackoffAction::Yield => std::thread::yield_now(),
            BackoffAction::Sleep(delay) => std::thread::sleep(delay),
        }
    }
}

/// Pluggable delay between failed transaction attempts.
pub trait BackoffPolicy: Send + Sync {
    /// Action for the given attempt (1-based: the attempt that just failed).
    fn backoff(&self, attempt: u32) -> BackoffAction;
}

/// No delay at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn backoff(&self, _attempt: u32) -> BackoffAction {
        BackoffAction::Retry
    }
}

/// Yield for the first few attempts, then sleep with an exponentially growing,
/// capped delay.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    yields: u32,
    min_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    /// Caps the delay at 100ms.
    pub const MAX_100_MS: ExponentialBackoff = ExponentialBackoff {
        yields: 3,
        min_delay: Duration::from_micros(100),
        max_delay: Duration::from_millis(100),
    };

    pub fn new(yields: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            yields,
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::MAX_100_MS
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn backoff(&self, attempt: u32) -> BackoffAction {
        if attempt <= self.yields {
            return BackoffAction::Yield;
        }
        let shift = (attempt - self.yields - 1).min(20);
        let delay = self
            .min_delay
            .saturating_mul(1 << shift)
            .min(self.max_delay);
        BackoffAction::Sleep(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_yields_then_sleeps() {
        let policy = ExponentialBackoff::MAX_100_MS;
        for attempt in 1..=3 {
            assert_eq!(policy.backoff(attempt), BackoffAction::Yield);
        }
        assert_eq!(
            policy.backoff(4),
            BackoffAction::Sleep(Duration::from_micros(100))
        );
        assert_eq!(
            policy.backoff(5),
            BackoffAction::Sleep(Duration::from_micros(200))
        );
    }

    #[test]
    fn test_exponential_is_capped() {
        let policy = ExponentialBackoff::MAX_100_MS;
        assert_eq!(
            policy.backoff(u32::MAX),
            BackoffAction::Sleep(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_no_backoff() {
        assert_eq!(NoBackoff.backoff(100), BackoffAction::Retry);
    }
}
