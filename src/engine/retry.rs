//! Retry decisions and backoff intervals.

use crate::types::{IntervalType, RetryConfig};
use std::time::Duration;

/// Retry settings of one task, bounded by the engine's backoff cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub limit: u32,
    pub interval: Duration,
    pub interval_type: IntervalType,
    pub max_interval: Duration,
}

/// What to do with a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again once `interval` has passed.
    Retry { interval: Duration },
    /// Out of retries; the failure is final.
    Fail,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig, max_interval: Duration) -> Self {
        Self {
            limit: config.limit,
            interval: Duration::from_secs(config.interval_secs),
            interval_type: config.interval_type,
            max_interval,
        }
    }

    /// Backoff before retry number `retry_count + 1`.
    pub fn next_interval(&self, retry_count: u32) -> Duration {
        let interval = match self.interval_type {
            IntervalType::Constant => self.interval,
            IntervalType::Exponential => {
                let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
                self.interval.checked_mul(factor).unwrap_or(Duration::MAX)
            }
        };
        interval.min(self.max_interval)
    }

    /// Decide after `retry_count` retries have already been spent.
    ///
    /// `override_interval` replaces the computed backoff when the executor
    /// asks for a specific delay.
    pub fn decide(&self, retry_count: u32, override_interval: Option<Duration>) -> RetryDecision {
        if retry_count >= self.limit {
            return RetryDecision::Fail;
        }
        let interval = override_interval
            .map(|d| d.min(self.max_interval))
            .unwrap_or_else(|| self.next_interval(retry_count));
        RetryDecision::Retry { interval }
    }
}
