//! Reference-counted per-key async mutex.
//!
//! Entries exist only while a holder or waiter references them, so the table
//! stays bounded by live contention rather than by key cardinality.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    refs: usize,
}

#[derive(Default)]
pub struct KeyLocker {
    entries: Mutex<FxHashMap<String, LockEntry>>,
}

impl KeyLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the key's mutex is held; the guard releases on drop.
    pub async fn lock(self: &Arc<Self>, key: &str) -> KeyGuard {
        let mutex = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(key.to_string()).or_insert_with(|| LockEntry {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.mutex.clone()
        };
        let guard = mutex.lock_owned().await;
        KeyGuard { locker: self.clone(), key: key.to_string(), _guard: guard }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(key);
            }
        }
    }
}

pub struct KeyGuard {
    locker: Arc<KeyLocker>,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.locker.release(&self.key);
    }
}
