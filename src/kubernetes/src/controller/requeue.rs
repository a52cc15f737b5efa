use std::{collections::HashMap, sync::Mutex, time::Duration};

pub const BASE_REQUEUE_SECS: u64 = 10;
pub const STEP_REQUEUE_SECS: u64 = 10;
pub const MAX_REQUEUE_SECS: u64 = 180;

/// Linear per-key backoff for failed reconciliations.
///
/// Keys are `namespace/name` for namespaced objects and `name` otherwise.
/// The table lives only in memory; a restarted process starts every key at the
/// base interval again.
#[derive(Debug, Default)]
pub struct RequeueTable {
    backoff: Mutex<HashMap<String, u64>>,
}

impl RequeueTable {
    pub fn new() -> RequeueTable {
        RequeueTable::default()
    }

    /// Returns how long to wait before the next attempt for `key`. The first
    /// call returns the base interval, every following call adds a step until
    /// the maximum is reached.
    pub fn get_requeue_time(&self, key: &str) -> Duration {
        let mut backoff = self
            .backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let secs = match backoff.get(key) {
            Some(prev) => (prev + STEP_REQUEUE_SECS).min(MAX_REQUEUE_SECS),
            None => BASE_REQUEUE_SECS,
        };
        backoff.insert(key.to_string(), secs);
        Duration::from_secs(secs)
    }

    /// Drops the entry for an object that no longer exists.
    pub fn forget(&self, key: &str) {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
