use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::error::BackendError;
use crate::error::Result;
use crate::record::Record;
use crate::store::StoreInner;

/// Populates the record cache from the backing store once per cache lifetime.
pub(crate) struct BulkLoader {
    loaded:    AtomicBool,
    load_lock: tokio::sync::Mutex<()>,
}

impl BulkLoader {
    pub(crate) fn new() -> Self {
        Self {
            loaded:    AtomicBool::new(false),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Declare the cache in sync with the backend without reading it; used once both have been wiped.
    pub(crate) fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// Load unless a load already completed. A caller arriving while another load is in flight waits for it and
    /// then returns without loading again. Returns the number of records inserted by this call.
    pub(crate) async fn ensure_loaded(&self, owner: &StoreInner) -> Result<usize> {
        if self.is_loaded() {
            return Ok(0);
        }

        let _guard = self.load_lock.lock().await;
        if self.is_loaded() {
            return Ok(0);
        }

        let count = self.load(owner).await?;
        self.mark_loaded();
        Ok(count)
    }

    #[instrument(level = "debug", skip_all)]
    async fn load(&self, owner: &StoreInner) -> Result<usize> {
        let keys = match owner.backend.keys().await {
            Ok(keys) => keys,
            Err(BackendError::Corrupted(reason)) if owner.config.clear_on_corruption() => {
                error!(
                    %reason,
                    "backing store reported corruption while loading records; clearing it. \
                     Previously stored records are lost"
                );
                owner.backend.clear().await?;
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };

        let prefix = owner.config.key_prefix();
        let keys: Vec<String> = keys.into_iter().filter(|k| k.starts_with(prefix.as_str())).collect();
        let key_count = keys.len();

        let mut inserted = 0;
        if key_count > owner.config.load_chunk_threshold() {
            let chunk_size = owner.config.load_chunk_size().max(1);
            debug!(keys = key_count, chunk_size, "loading records in chunks");
            for (n, chunk) in keys.chunks(chunk_size).enumerate() {
                if n > 0 {
                    tokio::task::yield_now().await;
                }
                inserted += self.load_keys(owner, chunk).await;
            }
        }
        else {
            inserted = self.load_keys(owner, &keys).await;
        }

        info!(keys = key_count, loaded = inserted, "record cache loaded");
        Ok(inserted)
    }

    async fn load_keys(&self, owner: &StoreInner, keys: &[String]) -> usize {
        let fetched = join_all(keys.iter().map(|key| fetch(owner, key))).await;
        let mut inserted = 0;
        for record in fetched.into_iter().flatten() {
            // Entries saved before the load finished are newer than what the backend holds.
            if owner.cache.insert_if_absent(Arc::new(record)).await {
                inserted += 1;
            }
        }
        inserted
    }
}

async fn fetch(owner: &StoreInner, key: &str) -> Option<Record> {
    let value = match owner.backend.get(key).await {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(err) => {
            warn!(key, %err, "failed to fetch record, skipping");
            return None;
        }
    };

    match Record::from_attributes(value) {
        Ok(record) if owner.storage_key(record.id()) == key => Some(record),
        Ok(record) => {
            warn!(key, id = record.id(), "stored record id doesn't match its key, skipping");
            None
        }
        Err(err) => {
            warn!(key, %err, "failed to deserialize record, skipping");
            None
        }
    }
}
