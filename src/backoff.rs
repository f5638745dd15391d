//! Per-record exponential backoff for transient reconcile errors.
//!
//! Lives in the hosting loop, not in the reconcilers: attempt counts are
//! keyed by record identity and reset on the first success.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::BackoffConfig;

/// Tracks consecutive failures per record.
pub struct Backoff {
    config: BackoffConfig,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Calculate delay for a given attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay =
            self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        Duration::from_secs_f64(base_delay.min(self.config.max_delay.as_secs_f64()))
    }

    /// Record a failure for `key` and return how long to wait.
    pub fn next_delay(&self, key: &str) -> Duration {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let entry = attempts.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        self.delay_for_attempt(attempt)
    }

    /// Forget failures for `key`, after a success or once the record is gone.
    pub fn reset(&self, key: &str) {
        self.attempts.lock().remove(key);
    }
}
