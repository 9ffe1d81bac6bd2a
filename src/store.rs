use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Weak;

use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::cache::RecordCache;
use crate::coalescer::write_clean_batch;
use crate::coalescer::WriteCoalescer;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::error::StoreError;
use crate::loader::BulkLoader;
use crate::record::dedupe_key;
use crate::record::Record;
use crate::traits::BackingStore;
use crate::types::FlushReport;
use crate::types::SourceSystem;

pub(crate) struct StoreInner {
    pub(crate) config:    StoreConfig,
    pub(crate) backend:   Arc<dyn BackingStore>,
    pub(crate) cache:     RecordCache,
    pub(crate) coalescer: WriteCoalescer,
    pub(crate) loader:    BulkLoader,
    myself:               Weak<StoreInner>,
}

impl StoreInner {
    pub(crate) fn myself(&self) -> Weak<StoreInner> {
        Weak::clone(&self.myself)
    }

    pub(crate) fn storage_key(&self, id: &str) -> String {
        format!("{}{id}", self.config.key_prefix())
    }

    pub(crate) async fn write_record(&self, record: &Record) -> Result<()> {
        let key = self.storage_key(record.id());
        let value = record.to_attributes()?;
        let outcome = self.backend.set(&key, value).await;
        outcome.map_err(|source| StoreError::Persistence { key, source })
    }

    pub(crate) async fn ensure_loaded(&self) -> Result<usize> {
        self.loader.ensure_loaded(self).await
    }

    /// Hand ids left dirty by an interrupted or rejected write back to the debounce task.
    pub(crate) fn reschedule_pending(&self) {
        if self.cache.pending_len() > 0 {
            self.coalescer.schedule(self);
        }
    }
}

/// Handle to a record store session.
///
/// The handle is cheap to clone and is meant to be passed to every component that reads or writes records. The
/// in-memory cache behind it is authoritative; the backing store follows it with a delay of at most one debounce
/// interval or one in-flight flush.
///
/// ```ignore
/// let store = RecordStore::open(Arc::new(MemoryStore::new()), StoreConfig::standard());
/// store.save_one(record).await?;
/// let all = store.find_all().await?;
/// store.close().await?;
/// ```
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

impl RecordStore {
    /// Open a session over `backend`. Nothing is read until the first access that needs the full record set.
    pub fn open(backend: Arc<dyn BackingStore>, config: StoreConfig) -> Self {
        let inner = Arc::new_cyclic(|myself| StoreInner {
            config,
            backend,
            cache: RecordCache::new(),
            coalescer: WriteCoalescer::new(),
            loader: BulkLoader::new(),
            myself: Weak::clone(myself),
        });
        Self { inner }
    }

    pub fn with_defaults(backend: Arc<dyn BackingStore>) -> Self {
        Self::open(backend, StoreConfig::standard())
    }

    pub(crate) fn inner(&self) -> &StoreInner {
        &self.inner
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> Arc<dyn BackingStore> {
        Arc::clone(&self.inner.backend)
    }

    /// Pull every stored record into the cache unless that already happened. Returns the number of records loaded by
    /// this call.
    pub async fn ensure_loaded(&self) -> Result<usize> {
        self.inner.ensure_loaded().await
    }

    /// Upsert a record and schedule a coalesced write.
    #[instrument(level = "debug", skip_all, fields(id = record.id()))]
    pub async fn save_one(&self, record: Record) -> Result<Arc<Record>> {
        record.check()?;
        let record = Arc::new(record);
        self.inner.cache.put(Arc::clone(&record)).await;
        self.inner.coalescer.schedule(&self.inner);
        Ok(record)
    }

    /// Save records bypassing the debounce: they are written right away in batches. Returns the number of records
    /// written by each batch. Records whose write failed stay in the cache and are retried by the coalescer.
    #[instrument(level = "debug", skip_all, fields(count = records.len()))]
    pub async fn save_many_immediate(&self, records: Vec<Record>) -> Result<Vec<usize>> {
        for record in &records {
            record.check()?;
        }

        let records: Vec<Arc<Record>> = records.into_iter().map(Arc::new).collect();
        let batch_size = self.inner.config.flush_batch_size().max(1);
        let mut counts = Vec::with_capacity(records.len() / batch_size + 1);
        for (n, batch) in records.chunks(batch_size).enumerate() {
            if n > 0 {
                tokio::task::yield_now().await;
            }
            // A flush holding an older snapshot must not land after these writes.
            let _flush_guard = self.inner.coalescer.exclusive().await;
            let outcome = write_clean_batch(&self.inner, batch).await;
            counts.push(outcome.written);
            for id in outcome.failed {
                self.inner.cache.mark_dirty(id);
            }
        }
        self.inner.reschedule_pending();
        Ok(counts)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Arc<Record>>> {
        self.inner.ensure_loaded().await?;
        Ok(self.inner.cache.get(id).await)
    }

    pub async fn find_all(&self) -> Result<Vec<Arc<Record>>> {
        self.inner.ensure_loaded().await?;
        Ok(self.inner.cache.snapshot())
    }

    /// Look a record up by its composite identity.
    pub async fn find_by_dedupe_key(&self, resource_id: &str, service: &str, region: &str) -> Result<Option<Arc<Record>>> {
        let Some(key) = dedupe_key(resource_id, service, region)
        else {
            return Ok(None);
        };
        self.inner.ensure_loaded().await?;

        // Ingested records use the dedupe key as their id; anything saved directly has to be searched for.
        if let Some(record) = self.inner.cache.get(&key).await {
            if record.dedupe_key().as_deref() == Some(key.as_str()) {
                return Ok(Some(record));
            }
        }
        Ok(self
            .inner
            .cache
            .snapshot()
            .into_iter()
            .find(|record| record.dedupe_key().as_deref() == Some(key.as_str())))
    }

    pub async fn find_by_source_system(&self, system: SourceSystem) -> Result<Vec<Arc<Record>>> {
        self.inner.ensure_loaded().await?;
        Ok(self
            .inner
            .cache
            .snapshot()
            .into_iter()
            .filter(|record| record.source_system() == system)
            .collect())
    }

    /// Remove a record. The backend copy is deleted by the next flush.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.ensure_loaded().await?;
        let removed = self.inner.cache.remove(id).await;
        if removed {
            self.inner.coalescer.schedule(&self.inner);
        }
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize> {
        self.inner.ensure_loaded().await?;
        Ok(self.inner.cache.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.inner.ensure_loaded().await?;
        Ok(self.inner.cache.is_empty())
    }

    /// Number of ids mutated since the last successful flush.
    pub fn pending_writes(&self) -> usize {
        self.inner.cache.pending_len()
    }

    /// Run a coalesced flush now. Rejected with a guard error if a flush is already running.
    pub async fn flush(&self) -> Result<FlushReport> {
        self.inner.coalescer.flush(&self.inner).await
    }

    /// Flush now with durability intent: the pending debounce is cancelled, a running flush is waited for, and the
    /// whole operation is bounded by the configured persistence timeout.
    #[instrument(level = "debug", skip(self))]
    pub async fn force_persist(&self) -> Result<FlushReport> {
        let budget = self.inner.config.persist_timeout();
        match tokio::time::timeout(budget, self.inner.coalescer.force_flush(&self.inner)).await {
            Ok(report) => report,
            Err(_) => {
                self.inner.coalescer.schedule(&self.inner);
                Err(StoreError::Timeout {
                    operation: "persist",
                    after:     budget,
                })
            }
        }
    }

    /// Wipe the cache and the backing store. If the backing store can't be wiped the cache is left as it was.
    #[instrument(level = "debug", skip(self))]
    pub async fn clear(&self) -> Result<()> {
        self.inner.coalescer.cancel_pending();
        let _flush_guard = self.inner.coalescer.exclusive().await;
        if let Err(err) = self.inner.backend.clear().await {
            self.inner.reschedule_pending();
            return Err(err.into());
        }
        self.inner.cache.clear().await;
        self.inner.loader.mark_loaded();
        info!("record store cleared");
        Ok(())
    }

    /// Persist everything outstanding and stop the debounce task.
    pub async fn close(&self) -> Result<FlushReport> {
        let report = self.force_persist().await;
        self.inner.coalescer.cancel_pending();
        debug!(?report, "record store closed");
        report
    }
}

impl Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("config", &self.inner.config)
            .field("loaded", &self.inner.loader.is_loaded())
            .field("pending_writes", &self.inner.cache.pending_len())
            .finish()
    }
}
