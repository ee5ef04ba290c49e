//! # store
//!
//! why: hold the applied key-value state that the replicated log converges on
//! relations: mutated only by node.rs apply paths, read directly by the dispatcher for GET
//! what: KvStore with apply/get/export/install

use std::collections::HashMap;
use std::sync::Mutex;

use crate::log::{LogEntry, Operation};

/// the applied state machine: latest value per key
///
/// applying the same entry twice is a no-op because a PUT overwrites with the
/// same value, so the apply path is idempotent per index. reads are served
/// from whatever this node has applied, with no consensus round.
#[derive(Default)]
pub struct KvStore {
    data: Mutex<HashMap<String, String>>,
}

impl KvStore {
    /// create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// apply one committed entry
    pub fn apply(&self, entry: &LogEntry) {
        match entry.op {
            Operation::Put => {
                self.data
                    .lock()
                    .unwrap()
                    .insert(entry.key.clone(), entry.value.clone());
            }
        }
    }

    /// current value for `key`, if any
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().get(key).cloned()
    }

    /// clone out the full mapping for snapshot capture
    pub fn export(&self) -> HashMap<String, String> {
        self.data.lock().unwrap().clone()
    }

    /// replace the state wholesale from an installed snapshot
    pub fn install(&self, state: HashMap<String, String>) {
        *self.data.lock().unwrap() = state;
    }

    /// number of live keys
    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
