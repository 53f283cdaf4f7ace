//! # Requeue Backoff
//!
//! Per-key requeue delays for failed reconciliation passes.
//!
//! Sequence: 1m, 1m, 2m, 3m, 5m, 8m, 10m (max). A key keeps its own
//! position in the sequence until a pass for it succeeds.

use std::collections::HashMap;
use std::time::Duration;

/// Position in the Fibonacci sequence, in minutes
#[derive(Debug, Clone, Copy)]
struct Step {
    prev_minutes: u64,
    current_minutes: u64,
}

/// Fibonacci backoff for every key with an outstanding failure
#[derive(Debug)]
pub struct KeyedBackoff {
    min_minutes: u64,
    max_minutes: u64,
    keys: HashMap<String, Step>,
}

impl KeyedBackoff {
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            min_minutes,
            max_minutes,
            keys: HashMap::new(),
        }
    }

    /// Delay before `key` is retried after another failure
    pub fn next_backoff(&mut self, key: &str) -> Duration {
        let min_minutes = self.min_minutes;
        let step = self.keys.entry(key.to_string()).or_insert(Step {
            prev_minutes: 0,
            current_minutes: min_minutes,
        });
        let delay = Duration::from_secs(step.current_minutes * 60);

        let next_minutes = step.prev_minutes + step.current_minutes;
        step.prev_minutes = step.current_minutes;
        step.current_minutes = next_minutes.min(self.max_minutes);

        delay
    }

    /// Forget `key` after a successful pass
    pub fn reset(&mut self, key: &str) {
        self.keys.remove(key);
    }

    /// Number of keys currently backing off
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.keys.len()
    }
}
