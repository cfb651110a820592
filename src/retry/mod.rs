//! Retry budgets and the in-memory attempt counter.
//!
//! Two ladders bound how often a failing message is reprocessed:
//! - primary path: attempts counted per message key in a `RetryTracker`,
//!   immediate redelivery until `max_attempts` is reached
//! - poison path: attempts carried in the `x-retries` header, each retry
//!   delayed by `2^n` backoff units
//!
//! Counters live only in memory and are lost on restart.

use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::config::RetryConfig;

/// Retry budgets and backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Primary-path failures before a message is moved to the poison queue.
    pub max_attempts: u32,
    /// Delayed retries on the poison path before a message is dropped.
    pub max_poison_retries: u32,
    /// One backoff unit; retry `n` waits `2^n` units.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_poison_retries: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_poison_retries: config.max_poison_retries,
            backoff_unit: Duration::from_millis(config.backoff_unit_ms),
        }
    }

    /// Delay before poison retry `retry` (1-based): 2, 4, 8 units for 1, 2, 3.
    pub fn poison_delay(&self, retry: u32) -> Duration {
        self.backoff_unit.saturating_mul(1u32 << retry.min(20))
    }

    /// Whether a message whose `x-retries` header reads `retries` may be
    /// scheduled for another delayed attempt.
    pub fn allows_poison_retry(&self, retries: u32) -> bool {
        retries < self.max_poison_retries
    }
}

/// What to do after a primary-path failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave the message on the primary queue for another attempt.
    Retry { attempt: u32 },
    /// Budget exhausted: move the message to the poison queue.
    Escalate { attempts: u32 },
}

/// Counts primary-path failures per message key.
///
/// Entries are created on first failure and removed on success or once the
/// message has been moved to the poison queue. Safe to share between
/// consumer tasks.
#[derive(Debug)]
pub struct RetryTracker {
    counts: DashMap<String, u32>,
    max_attempts: u32,
}

impl RetryTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            counts: DashMap::new(),
            max_attempts,
        }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.max_attempts)
    }

    /// Record one failure for `key` and decide whether to escalate.
    ///
    /// The count is kept on escalation; call `clear` once the message has
    /// actually been handed to the poison queue.
    pub fn record_failure(&self, key: &str) -> RetryDecision {
        let attempts = {
            let mut entry = self.counts.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        debug!(message_key = %key, attempts, max_attempts = self.max_attempts, "Recorded failure");

        if attempts >= self.max_attempts {
            RetryDecision::Escalate { attempts }
        } else {
            RetryDecision::Retry { attempt: attempts }
        }
    }

    /// Forget the failures recorded for `key`.
    pub fn clear(&self, key: &str) {
        self.counts.remove(key);
    }

    /// Failures currently recorded for `key` (0 if none).
    pub fn attempts(&self, key: &str) -> u32 {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Number of keys with recorded failures.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests;
