use rand::Rng;
use std::time::Duration;

/// Largest share of the computed delay added as jitter.
const JITTER_RATIO: u32 = 10;

/// Compute the delay before the next retry of a job that has made `attempt` attempts.
///
/// The delay is `min(base_delay * 2^attempt, max_delay)`. With `jitter` enabled a
/// uniform random amount of up to 10% of that delay is added on top, so jittered
/// delays may overshoot `max_delay` by at most that amount.
pub fn calculate_delay(
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
) -> Duration {
    let capped = 2_u32
        .checked_pow(attempt)
        .and_then(|factor| base_delay.checked_mul(factor))
        .map_or(max_delay, |delay| delay.min(max_delay));

    if !jitter {
        return capped;
    }

    let spread_ms = u64::try_from((capped / JITTER_RATIO).as_millis()).unwrap_or(u64::MAX);
    if spread_ms == 0 {
        return capped;
    }

    capped.saturating_add(Duration::from_millis(rand::rng().random_range(0..=spread_ms)))
}

/// Retry delay settings applied by the queue when rescheduling a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_delay(attempt, self.base_delay, self.max_delay, self.jitter)
    }
}
