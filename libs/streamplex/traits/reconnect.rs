use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Trait for defining reconnection backoff
///
/// The supervisor asks for a delay before every attempt to re-establish a
/// subscription. Attempts are counted per topic and reset once a connection
/// reaches `Open`.
pub trait ReconnectionStrategy: Send + Sync {
    /// Get the delay before reconnection attempt `attempt` (0-indexed)
    ///
    /// # Returns
    /// * `Some(duration)` - Wait this long, then reconnect
    /// * `None` - Attempts are exhausted; the topic fails permanently
    fn next_delay(&self, attempt: usize) -> Option<Duration>;

    /// Upper bound on attempts (None = unlimited)
    fn max_attempts(&self) -> Option<usize>;

    fn allows(&self, attempt: usize) -> bool {
        self.max_attempts().map_or(true, |max| attempt < max)
    }
}

/// Which backoff schedule to build from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Linear,
    Exponential,
}

/// Exponential backoff: initial_delay * 2^attempt, capped at max_delay
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<usize>,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: Option<usize>) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
        }
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: usize) -> Option<Duration> {
        if !self.allows(attempt) {
            return None;
        }

        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }

    fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }
}

/// Incremental backoff: initial_delay * (attempt + 1), capped at max_delay
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    max_delay: Duration,
    max_attempts: Option<usize>,
}

impl LinearBackoff {
    pub fn new(step: Duration, max_delay: Duration, max_attempts: Option<usize>) -> Self {
        Self {
            step,
            max_delay,
            max_attempts,
        }
    }
}

impl ReconnectionStrategy for LinearBackoff {
    fn next_delay(&self, attempt: usize) -> Option<Duration> {
        if !self.allows(attempt) {
            return None;
        }

        let multiplier = u32::try_from(attempt.saturating_add(1)).unwrap_or(u32::MAX);
        let delay = self.step.checked_mul(multiplier).unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }

    fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }
}

/// Same delay before every attempt
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<usize>,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: Option<usize>) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }
}

impl ReconnectionStrategy for FixedDelay {
    fn next_delay(&self, attempt: usize) -> Option<Duration> {
        self.allows(attempt).then_some(self.delay)
    }

    fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }
}

/// A failed subscription is reported immediately and never retried
#[derive(Debug, Clone)]
pub struct NeverReconnect;

impl ReconnectionStrategy for NeverReconnect {
    fn next_delay(&self, _attempt: usize) -> Option<Duration> {
        None
    }

    fn max_attempts(&self) -> Option<usize> {
        Some(0)
    }
}
