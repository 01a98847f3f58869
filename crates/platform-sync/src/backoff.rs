// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential retry backoff.
//!
//! `delay(attempt) = min(base * 2^attempt, max)`

use std::time::Duration;

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(900))
    }
}

impl BackoffPolicy {
    /// Create a policy with the given base delay and cap.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay for a zero-based attempt index.
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Delay before retrying an item that has failed `attempts` times.
    ///
    /// The first failure waits `base`.
    pub fn retry_delay(&self, attempts: i32) -> Duration {
        let index = attempts.saturating_sub(1).max(0) as u32;
        self.delay(index)
    }
}
