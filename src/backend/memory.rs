use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::BackendError;
use crate::traits::BackingStore;

/// In-process backing store.
///
/// Besides holding data it can simulate a misbehaving remote: slow writes, per-key write failures, an unreachable
/// service, or a store that reports itself corrupted when listed. Successful writes are counted per key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data:           RwLock<BTreeMap<String, Value>>,
    write_delay:    Mutex<Duration>,
    failing_keys:   Mutex<HashSet<String>>,
    unavailable:    AtomicBool,
    corrupted:      AtomicBool,
    total_writes:   AtomicUsize,
    writes_per_key: Mutex<HashMap<String, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_delay(self, delay: Duration) -> Self {
        *self.write_delay.lock() = delay;
        self
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Make every write to `key` fail until [`heal`](Self::heal) is called.
    pub fn fail_writes_for<S: Into<String>>(&self, key: S) {
        self.failing_keys.lock().insert(key.into());
    }

    pub fn heal(&self) {
        self.failing_keys.lock().clear();
        self.unavailable.store(false, Ordering::SeqCst);
        self.corrupted.store(false, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// While set, listing keys reports corruption. Cleared by a successful [`clear`](BackingStore::clear).
    pub fn set_corrupted(&self, corrupted: bool) {
        self.corrupted.store(corrupted, Ordering::SeqCst);
    }

    /// Place a raw value under `key`, bypassing counters and fault injection.
    pub fn insert_raw<S: Into<String>>(&self, key: S, value: Value) {
        self.data.write().insert(key.into(), value);
    }

    pub fn peek(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Number of successful writes of `key`.
    pub fn write_count(&self, key: &str) -> usize {
        self.writes_per_key.lock().get(key).copied().unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.total_writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("memory store switched off".into()))
        }
        else {
            Ok(())
        }
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.check_available()?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), BackendError> {
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.check_available()?;
        if self.failing_keys.lock().contains(key) {
            return Err(BackendError::Unavailable(format!("write of '{key}' rejected")));
        }

        self.data.write().insert(key.to_string(), value);
        self.total_writes.fetch_add(1, Ordering::SeqCst);
        *self.writes_per_key.lock().entry(key.to_string()).or_default() += 1;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, BackendError> {
        self.check_available()?;
        if self.corrupted.load(Ordering::SeqCst) {
            return Err(BackendError::Corrupted("key index unreadable".into()));
        }
        Ok(self.data.read().keys().cloned().collect())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.check_available()?;
        self.data.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.check_available()?;
        self.data.write().clear();
        self.corrupted.store(false, Ordering::SeqCst);
        Ok(())
    }
}
