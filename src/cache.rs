use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use moka::future::Cache;
use parking_lot::Mutex;
use tracing::trace;

use crate::record::Record;

/// In-memory view of every record, keyed by record id. This is the authoritative state of a session; the backing
/// store only ever follows it.
///
/// The underlying moka cache is built without a capacity bound, so nothing is evicted behind the store's back. Every
/// `put`/`remove` marks the id dirty in the pending-write set the coalescer drains.
pub(crate) struct RecordCache {
    entries:    Cache<String, Arc<Record>>,
    pending:    Mutex<HashSet<String>>,
    // Bumped on every mutation; lets a flush tell whether something changed while it was running.
    generation: AtomicU64,
}

impl RecordCache {
    pub(crate) fn new() -> Self {
        Self {
            entries:    Cache::builder().name("records").build(),
            pending:    Mutex::new(HashSet::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) async fn get(&self, id: &str) -> Option<Arc<Record>> {
        self.entries.get(id).await
    }

    /// Upsert and mark dirty.
    pub(crate) async fn put(&self, record: Arc<Record>) {
        trace!(id = record.id(), "cache put");
        let id = record.id().to_string();
        self.entries.insert(id.clone(), record).await;
        self.mark_dirty(id);
    }

    /// Upsert without marking dirty; for records that have just been written to, or read from, the backend.
    pub(crate) async fn put_clean(&self, record: Arc<Record>) {
        self.entries.insert(record.id().to_string(), record).await;
    }

    /// Insert unless the id is already cached. Returns `true` if the record went in.
    pub(crate) async fn insert_if_absent(&self, record: Arc<Record>) -> bool {
        self.entries
            .entry(record.id().to_string())
            .or_insert(record)
            .await
            .is_fresh()
    }

    pub(crate) async fn remove(&self, id: &str) -> bool {
        let removed = self.entries.remove(id).await.is_some();
        if removed {
            self.mark_dirty(id.to_string());
        }
        removed
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Record>> {
        self.entries.iter().map(|(_, record)| record).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.iter().next().is_none()
    }

    /// Drop every entry and forget pending writes.
    pub(crate) async fn clear(&self) {
        let ids: Vec<Arc<String>> = self.entries.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.entries.invalidate(id.as_str()).await;
        }
        self.pending.lock().clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_dirty(&self, id: String) {
        self.pending.lock().insert(id);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn take_pending(&self) -> HashSet<String> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Put ids back into the pending set after their write failed.
    pub(crate) fn restore_pending<I: IntoIterator<Item = String>>(&self, ids: I) {
        self.pending.lock().extend(ids);
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Ids taken out of the pending set for a write that may not finish. Unless disarmed, dropping the guard puts them
/// back, so a write cancelled by a timeout or an aborted task leaves its records dirty.
pub(crate) struct PendingGuard<'a> {
    cache: &'a RecordCache,
    ids:   Vec<String>,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(cache: &'a RecordCache, ids: Vec<String>) -> Self {
        Self { cache, ids }
    }

    pub(crate) fn ids(&self) -> &[String] {
        &self.ids
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub(crate) fn disarm(mut self) -> Vec<String> {
        std::mem::take(&mut self.ids)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.ids.is_empty() {
            trace!(ids = self.ids.len(), "write interrupted, ids stay pending");
            self.cache.restore_pending(self.ids.drain(..));
        }
    }
}
