// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Retry policy shared by the mint and withdrawal paths.
//!
//! The withdrawal pipeline uses [`RetryPolicy::bump`] to price replacement
//! transactions and [`RetryPolicy::exhausted`] to stop escalating. The mint
//! dispatcher uses [`RetryPolicy::backoff_for`] to space out retries of
//! transient ledger failures, and the same `max_attempts` to decide when a
//! failing mint deserves an error log.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest bump accepted by nodes for a same-nonce replacement.
pub const MIN_BUMP_PERCENT: u64 = 10;

const MAX_DOUBLINGS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryPolicy {
    #[serde(default = "default_bump_percent")]
    pub bump_percent: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_bump_percent() -> u64 {
    MIN_BUMP_PERCENT
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    400
}

fn default_max_backoff_secs() -> u64 {
    120
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            bump_percent: default_bump_percent(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl RetryPolicy {
    pub fn with_bump_percent(mut self, bump_percent: u64) -> Self {
        self.bump_percent = bump_percent;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_secs = max.as_secs();
        self
    }

    /// `value * (100 + bump_percent) / 100`, rounded up so that a non-zero
    /// value always strictly increases.
    pub fn bump(&self, value: U256) -> U256 {
        let factor = U256::from(100 + self.bump_percent.max(MIN_BUMP_PERCENT));
        let scaled = value.saturating_mul(factor);
        let (quotient, remainder) = scaled.div_mod(U256::from(100));
        if remainder.is_zero() {
            quotient
        } else {
            quotient.saturating_add(U256::one())
        }
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before attempt number `attempts + 1`: doubles from the initial
    /// backoff and is capped at `max_backoff_secs`.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let mut schedule = self.backoff_schedule();
        let mut delay = schedule.initial_interval;
        // The cap is reached long before this many doublings.
        for _ in 0..=attempts.min(MAX_DOUBLINGS) {
            match schedule.next_backoff() {
                Some(next) => delay = next,
                None => break,
            }
        }
        delay.min(schedule.max_interval)
    }

    /// Deterministic doubling schedule between the configured bounds.
    fn backoff_schedule(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: Duration::from_secs(self.max_backoff_secs),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_is_at_least_ten_percent() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.bump(U256::from(100)), U256::from(110));
        assert_eq!(policy.bump(U256::from(1)), U256::from(2));
        assert_eq!(policy.bump(U256::zero()), U256::zero());
        assert_eq!(policy.bump(U256::from(1_000_000_007u64)), U256::from(1_100_000_008u64));
    }

    #[test]
    fn test_bump_below_minimum_is_clamped() {
        let policy = RetryPolicy::default().with_bump_percent(3);
        assert_eq!(policy.bump(U256::from(1000)), U256::from(1100));
        let policy = RetryPolicy::default().with_bump_percent(25);
        assert_eq!(policy.bump(U256::from(1000)), U256::from(1250));
    }

    #[test]
    fn test_bump_saturates() {
        let policy = RetryPolicy::default();
        assert!(policy.bump(U256::MAX) >= U256::MAX / U256::from(100));
    }

    #[test]
    fn test_exhausted() {
        let policy = RetryPolicy::default().with_max_attempts(2);
        assert!(!policy.exhausted(0));
        assert!(!policy.exhausted(1));
        assert!(policy.exhausted(2));
    }

    #[test]
    fn test_backoff_doubles_and_is_bounded() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_for(4), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_with_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1_600));
        assert_eq!(policy.backoff_for(9), Duration::from_secs(120));
        // An initial delay above the cap is clamped.
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_secs(5), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(0), Duration::from_secs(2));
    }

    #[test]
    fn test_serde_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, RetryPolicy::default());
        let policy: RetryPolicy = serde_json::from_str(r#"{"bump-percent": 20}"#).unwrap();
        assert_eq!(policy.bump_percent, 20);
        assert_eq!(policy.max_attempts, 5);
    }
}
