//! Reconciliation work queue.
//!
//! Watch events are reduced to `namespace/name` keys. A key sits in the
//! queue at most once, so a burst of events for one Endpoints object
//! collapses into a single pass. Delivery is at-least-once per key, and a
//! key still waiting when the queue shuts down is dropped.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    shut_down: bool,
}

/// Deduplicating FIFO of reconciliation keys
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `key` unless it is already waiting
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.state();
            if state.shut_down || state.queued.contains(&key) {
                return;
            }
            state.queued.insert(key.clone());
            state.pending.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Enqueue `key` once `delay` has elapsed
    pub fn requeue_after(self: &Arc<Self>, key: String, delay: Duration) {
        debug!("Requeueing {} in {:?}", key, delay);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn next(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state();
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    return Some(key);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop handing out keys and wake waiting workers. Keys that have not
    /// been dequeued yet are cancelled; returns how many were dropped.
    pub fn shutdown(&self) -> usize {
        let dropped = {
            let mut state = self.state();
            state.shut_down = true;
            state.queued.clear();
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        self.notify.notify_waiters();
        // A worker between its state check and `notified()` picks up the stored permit
        self.notify.notify_one();
        dropped
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
