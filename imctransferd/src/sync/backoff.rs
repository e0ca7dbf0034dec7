use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Capped exponential delay: `base * 2^attempt`, never above `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter && exp > 0 {
            // Equal jitter: the delay never drops below half the window.
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

/// Bounded retry schedule. Attempts are counted from 1; once `max_attempts`
/// have been made there is no further delay and the caller must give up.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    backoff: Backoff,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }

    pub fn delay_after(&self, attempts_made: u32) -> Option<Duration> {
        if self.exhausted(attempts_made) {
            return None;
        }
        Some(self.backoff.delay(attempts_made.saturating_sub(1)))
    }

    /// Like [`RetryPolicy::delay_after`], but never shorter than a
    /// server-provided `Retry-After` hint.
    pub fn delay_with_hint(&self, attempts_made: u32, hint: Option<Duration>) -> Option<Duration> {
        let delay = self.delay_after(attempts_made)?;
        Some(hint.map_or(delay, |hint| delay.max(hint)))
    }

    /// Sleeps for `delay`, returning `false` if `cancel` fired first.
    pub async fn wait(delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
