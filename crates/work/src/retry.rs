//! Retry schedules for best-effort jobs.
//!
//! A job that wants "try again later, give up after N attempts" implements
//! [`Retryable`] (or holds a [`RetrySchedule`]) and ends a failed run with
//! `attempt_later_or_complete`. Exhausted retries complete silently: the work
//! is abandoned, not dead-lettered.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::result::JobResult;

/// Backoff step function for a job.
pub trait Retryable {
    /// When to try again after `previous_attempts` reattempts, or `None` to give up.
    fn calculate_next_attempt_date(
        &self,
        previous_attempts: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;

    fn attempt_later_or_complete<S>(
        &self,
        previous_attempts: u32,
        now: DateTime<Utc>,
        state: S,
    ) -> JobResult<S> {
        match self.calculate_next_attempt_date(previous_attempts, now) {
            Some(next_try_at) => JobResult::reattempt(state, next_try_at),
            None => JobResult::Completed,
        }
    }
}

/// Ordered table of delays; entry `n` applies after `n` previous attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// A schedule that never retries.
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.delays.len()).unwrap_or(u32::MAX)
    }

    pub fn delay_for(&self, previous_attempts: u32) -> Option<Duration> {
        usize::try_from(previous_attempts)
            .ok()
            .and_then(|i| self.delays.get(i))
            .copied()
    }
}

impl Default for RetrySchedule {
    /// 5 minutes, 1 hour, 2 hours, 6 hours, 12 hours.
    fn default() -> Self {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        Self::new(vec![
            Duration::from_secs(5 * MINUTE),
            Duration::from_secs(HOUR),
            Duration::from_secs(2 * HOUR),
            Duration::from_secs(6 * HOUR),
            Duration::from_secs(12 * HOUR),
        ])
    }
}

impl Retryable for RetrySchedule {
    fn calculate_next_attempt_date(
        &self,
        previous_attempts: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let delay = self.delay_for(previous_attempts)?;
        let delay = chrono::Duration::from_std(delay).ok()?;
        now.checked_add_signed(delay)
    }
}

/// Backoff strategy for generated schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Parametric description of a retry schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(12 * 60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }

    /// Materialize the policy as a delay table.
    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule::new(
            (1..=self.max_attempts)
                .map(|attempt| self.delay_for_attempt(attempt))
                .collect(),
        )
    }
}

impl From<RetryPolicy> for RetrySchedule {
    fn from(policy: RetryPolicy) -> Self {
        policy.schedule()
    }
}
