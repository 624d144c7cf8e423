//! In-memory latest-known progress per job.
//!
//! Workers persist progress throttled; this map always holds the newest
//! value so same-process status polls can report it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Clone, Default)]
pub struct LiveProgress {
    inner: Arc<RwLock<HashMap<String, u8>>>,
}

impl LiveProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `percent` for `job_id`, never lowering an existing value.
    pub fn set(&self, job_id: &str, percent: u8) {
        let mut map = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Live progress lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let entry = map.entry(job_id.to_string()).or_insert(0);
        *entry = (*entry).max(percent.min(100));
    }

    pub fn get(&self, job_id: &str) -> Option<u8> {
        let map = match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(job_id).copied()
    }

    pub fn remove(&self, job_id: &str) {
        let mut map = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(job_id);
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(g) => g.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
