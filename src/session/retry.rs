//! Retry timing and give-up decisions
//!
//! Pure bookkeeping: the scheduler never sleeps itself. The connection
//! manager asks it what to do after each failure and owns the (cancellable)
//! timer.

use std::time::Duration;

/// Capped binary exponential backoff policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
    /// Base delay; retry `n` waits `base * 2^n`
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt, max)`, saturating on overflow
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        let cap_ms = self.max_delay.as_millis();
        let scaled_ms = if attempt >= 64 {
            u128::MAX
        } else {
            base_ms.saturating_mul(1u128 << attempt)
        };
        let delay_ms = scaled_ms.min(cap_ms);
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }

    /// Total time spent waiting if every attempt fails
    pub fn max_total_delay(&self) -> Duration {
        (1..self.max_attempts).map(|attempt| self.delay_for(attempt)).sum()
    }

    /// Validate policy consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be greater than 0".to_string());
        }
        if self.base_delay.is_zero() {
            return Err("retry.base_delay_ms must be greater than 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("retry.max_delay_ms must not be smaller than retry.base_delay_ms".to_string());
        }
        Ok(())
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then start retry number `attempt`
    Retry { attempt: u32, delay: Duration },
    /// No retries remain
    Exhausted { attempts: u32 },
}

/// Tracks consecutive failures for one connection cycle
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Consecutive failures since the last success
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    /// Called when a session comes up
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Record a failure and decide whether to retry
    pub fn record_failure(&mut self) -> RetryDecision {
        self.attempt = self.attempt.saturating_add(1);

        if self.is_exhausted() {
            return RetryDecision::Exhausted {
                attempts: self.attempt,
            };
        }

        RetryDecision::Retry {
            attempt: self.attempt,
            delay: self.policy.delay_for(self.attempt),
        }
    }
}
