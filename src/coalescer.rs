use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::MutexGuard;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::cache::PendingGuard;
use crate::error::BackendError;
use crate::error::Result;
use crate::error::StoreError;
use crate::record::Record;
use crate::store::StoreInner;
use crate::types::FlushReport;

/// Outcome of one concurrently written batch.
#[derive(Debug, Default)]
pub(crate) struct BatchOutcome {
    pub(crate) written: usize,
    pub(crate) failed:  Vec<String>,
}

/// Turns bursts of cache mutations into a bounded number of backing-store write rounds.
///
/// Every mutation pokes a debounce task; once no mutation has arrived for the configured quiet period the task runs a
/// flush. A flush always writes a snapshot of the whole cache, not only the dirty entries, so the backend converges on
/// the cache state even if earlier rounds lost writes. Only one flush runs at a time.
pub(crate) struct WriteCoalescer {
    flush_lock:    tokio::sync::Mutex<()>,
    notify:        Arc<Notify>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
}

impl WriteCoalescer {
    pub(crate) fn new() -> Self {
        Self {
            flush_lock:    tokio::sync::Mutex::new(()),
            notify:        Arc::new(Notify::new()),
            debounce_task: Mutex::new(None),
        }
    }

    /// (Re)start the debounce timer.
    pub(crate) fn schedule(&self, owner: &StoreInner) {
        {
            let mut task = self.debounce_task.lock();
            if task.as_ref().map_or(true, |t| t.is_finished()) {
                debug!("starting debounce task");
                *task = Some(tokio::spawn(debounce_loop(
                    owner.myself(),
                    Arc::clone(&self.notify),
                    owner.config.debounce(),
                )));
            }
        }
        self.notify.notify_one();
    }

    /// Drop the pending debounce timer, if any.
    pub(crate) fn cancel_pending(&self) {
        if let Some(task) = self.debounce_task.lock().take() {
            task.abort();
        }
    }

    /// Wait for any running flush and keep others out while the guard lives.
    pub(crate) async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.flush_lock.lock().await
    }

    /// Flush unless another flush is already running, in which case the request is rejected rather than queued.
    pub(crate) async fn flush(&self, owner: &StoreInner) -> Result<FlushReport> {
        let Ok(_guard) = self.flush_lock.try_lock()
        else {
            return Err(StoreError::ConcurrencyGuard("flush"));
        };
        self.flush_round(owner).await
    }

    /// Cancel the debounce timer and flush now, waiting for a running flush first. Extra rounds are run while
    /// mutations keep arriving during a round, up to the configured limit.
    #[instrument(level = "debug", skip_all)]
    pub(crate) async fn force_flush(&self, owner: &StoreInner) -> Result<FlushReport> {
        self.cancel_pending();
        let _guard = self.flush_lock.lock().await;

        let mut report = FlushReport::default();
        for _ in 0..owner.config.max_flush_rounds().max(1) {
            let generation = owner.cache.generation();
            report.absorb(self.flush_round(owner).await?);
            if owner.cache.generation() == generation || owner.cache.pending_len() == 0 {
                break;
            }
            debug!("cache changed during flush, running another round");
        }
        Ok(report)
    }

    // Callers must hold the flush lock.
    async fn flush_round(&self, owner: &StoreInner) -> Result<FlushReport> {
        let pending = PendingGuard::new(&owner.cache, owner.cache.take_pending().into_iter().collect());
        if pending.is_empty() {
            return Ok(FlushReport::default());
        }

        let snapshot = owner.cache.snapshot();
        info!(records = snapshot.len(), dirty = pending.ids().len(), "flushing record cache");

        let outcomes = write_records(owner, &snapshot, owner.config.flush_batch_size()).await;
        let mut report = FlushReport {
            rounds: 1,
            ..Default::default()
        };
        let mut failed = Vec::new();
        for outcome in outcomes {
            report.written += outcome.written;
            failed.extend(outcome.failed);
        }

        let live: HashSet<&str> = snapshot.iter().map(|r| r.id()).collect();
        let removed: Vec<&String> = pending
            .ids()
            .iter()
            .filter(|id| !live.contains(id.as_str()))
            .collect();
        for (n, chunk) in removed.chunks(owner.config.flush_batch_size().max(1)).enumerate() {
            if n > 0 {
                tokio::task::yield_now().await;
            }
            let keys: Vec<String> = chunk.iter().map(|id| owner.storage_key(id)).collect();
            let results = join_all(keys.iter().map(|key| owner.backend.delete(key))).await;
            for (id, result) in chunk.iter().zip(results) {
                match result {
                    Ok(()) => report.deleted += 1,
                    Err(err) => {
                        warn!(id = id.as_str(), %err, "failed to delete record from backing store, skipping");
                        failed.push((*id).clone());
                    }
                }
            }
        }
        pending.disarm();

        report.failed = failed.len();
        if !failed.is_empty() {
            warn!(failed = report.failed, "flush left records dirty");
            owner.cache.restore_pending(failed);
        }

        if report.written == 0 && report.deleted == 0 && report.failed > 0 {
            return Err(StoreError::Backend(BackendError::Unavailable(format!(
                "none of {} operations succeeded",
                report.failed
            ))));
        }

        Ok(report)
    }
}

impl Drop for WriteCoalescer {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

async fn debounce_loop(owner: Weak<StoreInner>, notify: Arc<Notify>, debounce: Duration) {
    loop {
        notify.notified().await;

        // Every further mutation restarts the quiet period.
        loop {
            let restarted = tokio::select! {
                _ = notify.notified() => true,
                _ = tokio::time::sleep(debounce) => false,
            };
            if !restarted {
                break;
            }
        }

        let Some(owner) = owner.upgrade()
        else {
            break;
        };
        match owner.coalescer.flush(&owner).await {
            Ok(report) => debug!(?report, "debounced flush done"),
            Err(err) if err.is_guard() => debug!("flush already running, dropping debounced request"),
            Err(err) => warn!(%err, "debounced flush failed"),
        }
    }
}

/// Write one batch with all writes in flight at once. Failures are logged and reported by record id.
pub(crate) async fn write_batch(owner: &StoreInner, batch: &[Arc<Record>]) -> BatchOutcome {
    let results = join_all(batch.iter().map(|record| owner.write_record(record))).await;
    let mut outcome = BatchOutcome::default();
    for (record, result) in batch.iter().zip(results) {
        match result {
            Ok(()) => outcome.written += 1,
            Err(err) => {
                warn!(id = record.id(), %err, "record write failed, skipping");
                outcome.failed.push(record.id().to_string());
            }
        }
    }
    outcome
}

/// Put a batch into the cache as clean and write it. Callers must hold the flush lock, otherwise a flush started
/// earlier could overwrite these records in the backend with its older snapshot. If the write is cancelled the ids
/// are left dirty.
pub(crate) async fn write_clean_batch(owner: &StoreInner, batch: &[Arc<Record>]) -> BatchOutcome {
    for record in batch {
        owner.cache.put_clean(Arc::clone(record)).await;
    }
    let in_flight = PendingGuard::new(&owner.cache, batch.iter().map(|r| r.id().to_string()).collect());
    let outcome = write_batch(owner, batch).await;
    in_flight.disarm();
    outcome
}

/// Write records in sequential batches of `batch_size`, yielding to the scheduler between batches.
pub(crate) async fn write_records(owner: &StoreInner, records: &[Arc<Record>], batch_size: usize) -> Vec<BatchOutcome> {
    let mut outcomes = Vec::with_capacity(records.len() / batch_size.max(1) + 1);
    for (n, batch) in records.chunks(batch_size.max(1)).enumerate() {
        if n > 0 {
            tokio::task::yield_now().await;
        }
        outcomes.push(write_batch(owner, batch).await);
    }
    outcomes
}
