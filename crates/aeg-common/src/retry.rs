use std::time::Duration;

/// Backoff shape used by the retry executor between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Always wait `base_delay`.
    Fixed,
    /// Wait `base_delay * (attempt + 1)`, capped at `max_delay`.
    #[default]
    Linear,
    /// Wait `base_delay * 2^attempt`, capped at `max_delay`.
    Exponential,
}

/// Retry policy: attempt budget, backoff shape, and jitter.
///
/// `classify` is supplied by the caller rather than stored on the policy,
/// since it depends on the error type of the operation being retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay used by all strategies.
    pub base_delay: Duration,
    /// Upper bound on computed delay (pre-jitter).
    pub max_delay: Duration,
    /// Backoff shape.
    pub strategy: RetryStrategy,
    /// Jitter fraction in `[0, 1]`; delay is perturbed by `+/- jitter_factor * delay`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: RetryStrategy::Exponential,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Compute the unjittered delay before the given zero-based attempt index.
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt + 1),
            RetryStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Serializable mirror of [`RetryPolicy`] for configuration loading.
///
/// `classify_exception` is not representable in configuration; each caller
/// (transport retry, writer retry) supplies its own hard-coded classifier.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff shape.
    pub strategy: RetryStrategy,
    /// Jitter fraction in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        let p = RetryPolicy::default();
        Self {
            max_attempts: p.max_attempts,
            base_delay_ms: p.base_delay.as_millis() as u64,
            max_delay_ms: p.max_delay.as_millis() as u64,
            strategy: p.strategy,
            jitter_factor: p.jitter_factor,
        }
    }
}

impl From<RetryPolicyConfig> for RetryPolicy {
    fn from(c: RetryPolicyConfig) -> Self {
        Self {
            max_attempts: c.max_attempts,
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            strategy: c.strategy,
            jitter_factor: c.jitter_factor,
        }
    }
}
