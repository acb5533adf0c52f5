use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory accumulator of message counts per user, shared between the
/// event handlers that record and the flusher that drains.
///
/// Entries are created on first record and removed only by [`drain`], which
/// swaps the whole map out under the lock. A record landing while a drained
/// batch is being written goes into the fresh map and survives to the next
/// flush; counts already drained are the flusher's to lose.
///
/// [`drain`]: MessageTally::drain
#[derive(Clone, Default)]
pub struct MessageTally {
    counts: Arc<Mutex<HashMap<String, i64>>>,
}

impl MessageTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to the pending count for `user_id`, starting from zero.
    pub fn record(&self, user_id: &str, amount: i64) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(user_id.to_string()).or_insert(0) += amount;
    }

    /// The common single-message path.
    pub fn record_one(&self, user_id: &str) {
        self.record(user_id, 1);
    }

    /// Pending count for one user; zero when nothing is recorded.
    pub fn pending(&self, user_id: &str) -> i64 {
        self.counts.lock().unwrap().get(user_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.lock().unwrap().is_empty()
    }

    /// Takes every pending count, leaving the tally empty.
    pub fn drain(&self) -> HashMap<String, i64> {
        std::mem::take(&mut *self.counts.lock().unwrap())
    }
}
