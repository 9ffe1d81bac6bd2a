//! Ingestion and deduplication of freshly parsed candidate records.
//!
//! A run indexes every stored record by its composite dedupe key once, up front, and then walks the candidates in
//! input order. A candidate whose key is already indexed has its monthly cost **added** to the indexed record; a
//! candidate with an unknown key becomes a new record. Merging is additive across files and across runs: importing
//! two reports that cover the same resource accumulates its cost instead of replacing it. Staged records are
//! persisted after every file in bounded, concurrently written batches.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::candidate::CandidateRecord;
use crate::candidate::SourceFile;
use crate::coalescer::write_clean_batch;
use crate::error::Result;
use crate::error::StoreError;
use crate::record::Record;
use crate::store::RecordStore;
use crate::types::IngestSummary;
use crate::types::Progress;
use crate::types::ProgressStatus;
use crate::types::SourceSystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Created,
    Merged,
    Untouched,
}

// Clears the single-flight flag however the run ends.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// In-memory state of a single ingestion run.
struct MergeRun {
    index:          HashMap<String, Arc<Record>>,
    seen:           HashMap<String, KeyState>,
    staged:         Vec<String>,
    epsilon:        f64,
    default_source: SourceSystem,
    skipped:        usize,
    failed_writes:  usize,
}

impl MergeRun {
    fn new(existing: Vec<Arc<Record>>, epsilon: f64, default_source: SourceSystem) -> Self {
        let mut index = HashMap::with_capacity(existing.len());
        for record in existing {
            if let Some(key) = record.dedupe_key() {
                if let Some(previous) = index.insert(key, record) {
                    warn!(id = previous.id(), "two stored records share a dedupe key; merging into the later one");
                }
            }
        }
        Self {
            index,
            seen: HashMap::new(),
            staged: Vec::new(),
            epsilon,
            default_source,
            skipped: 0,
            failed_writes: 0,
        }
    }

    fn absorb(&mut self, candidate: &CandidateRecord, file_source: Option<SourceSystem>) {
        let Some(key) = candidate.dedupe_key()
        else {
            debug!("candidate without resource id, skipping");
            self.skipped += 1;
            return;
        };

        match self.merge(candidate, &key, file_source) {
            Ok(Some((record, state))) => {
                self.index.insert(key.clone(), Arc::new(record));
                match self.seen.entry(key.clone()) {
                    Entry::Occupied(mut seen) => {
                        if *seen.get() == KeyState::Untouched {
                            seen.insert(state);
                        }
                    }
                    Entry::Vacant(seen) => {
                        seen.insert(state);
                    }
                }
                self.staged.push(key);
            }
            Ok(None) => {
                self.seen.entry(key).or_insert(KeyState::Untouched);
            }
            Err(err) => {
                warn!(key = %key, %err, "skipping candidate");
                self.skipped += 1;
            }
        }
    }

    fn merge(
        &self,
        candidate: &CandidateRecord,
        key: &str,
        file_source: Option<SourceSystem>,
    ) -> Result<Option<(Record, KeyState)>> {
        let Some(existing) = self.index.get(key)
        else {
            let record = candidate.to_record(key.to_string(), file_source.unwrap_or(self.default_source))?;
            return Ok(Some((record, KeyState::Created)));
        };

        let delta = candidate.cost_delta();
        if !delta.is_finite() {
            return Err(StoreError::Validation(format!("cost delta {delta} is not a finite number")));
        }
        if delta.abs() <= self.epsilon {
            return Ok(None);
        }
        if let Some(currency) = candidate.currency.as_deref() {
            if currency != existing.currency() {
                warn!(key, currency, stored = existing.currency(), "currency mismatch, adding amount as is");
            }
        }
        Ok(Some((existing.with_added_cost(delta)?, KeyState::Merged)))
    }

    /// Staged records in first-staged order, each at its latest merged value.
    fn drain_staged(&mut self) -> Vec<Arc<Record>> {
        let mut taken = std::collections::HashSet::with_capacity(self.staged.len());
        let staged = std::mem::take(&mut self.staged);
        staged
            .into_iter()
            .filter(|key| taken.insert(key.clone()))
            .filter_map(|key| self.index.get(&key).cloned())
            .collect()
    }

    fn summary(&self) -> IngestSummary {
        let mut summary = IngestSummary {
            unique_count: self.seen.len(),
            skipped_count: self.skipped,
            failed_writes: self.failed_writes,
            ..Default::default()
        };
        for state in self.seen.values() {
            match state {
                KeyState::Created => summary.new_count += 1,
                KeyState::Merged => summary.updated_count += 1,
                KeyState::Untouched => summary.unchanged_count += 1,
            }
        }
        summary
    }
}

/// Single-flight ingestion over a [`RecordStore`].
pub struct IngestPipeline {
    store:   RecordStore,
    running: AtomicBool,
}

impl IngestPipeline {
    pub fn new(store: RecordStore) -> Self {
        Self {
            store,
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ingest candidates coming from a single, unnamed source.
    pub async fn ingest<F>(&self, candidates: Vec<CandidateRecord>, on_progress: F) -> Result<IngestSummary>
    where
        F: FnMut(Progress) + Send,
    {
        self.ingest_files(vec![SourceFile::new("candidates", candidates)], on_progress)
            .await
    }

    /// Ingest several source files in sequence as one run.
    ///
    /// Fails immediately with a guard error if another run is in progress on this pipeline, and with a timeout error
    /// if the run exceeds the configured budget. Records persisted before a timeout stay persisted.
    #[instrument(level = "debug", skip_all, fields(files = files.len()))]
    pub async fn ingest_files<F>(&self, files: Vec<SourceFile>, mut on_progress: F) -> Result<IngestSummary>
    where
        F: FnMut(Progress) + Send,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StoreError::ConcurrencyGuard("ingestion"));
        }
        let _guard = RunGuard { flag: &self.running };

        let budget = self.store.config().ingest_timeout();
        match tokio::time::timeout(budget, self.run(files, &mut on_progress)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(?budget, "ingestion timed out; records persisted so far are kept");
                let inner = self.store.inner();
                inner.coalescer.schedule(inner);
                Err(StoreError::Timeout {
                    operation: "ingestion",
                    after:     budget,
                })
            }
        }
    }

    async fn run<F>(&self, files: Vec<SourceFile>, on_progress: &mut F) -> Result<IngestSummary>
    where
        F: FnMut(Progress) + Send,
    {
        let started = Instant::now();
        let config = self.store.config();
        let batch_size = config.ingest_batch_size().max(1);
        let total: usize = files.iter().map(|f| f.candidates.len()).sum();

        on_progress(Progress::new(0, total, "stored records", ProgressStatus::Loading));
        let existing = self.store.find_all().await?;
        let mut run = MergeRun::new(existing, config.merge_epsilon(), config.default_source_system());

        let mut processed = 0;
        for file in &files {
            info!(file = %file.name, candidates = file.candidates.len(), "ingesting file");
            on_progress(Progress::new(processed, total, &file.name, ProgressStatus::Processing));

            for (i, candidate) in file.candidates.iter().enumerate() {
                run.absorb(candidate, file.source_system);
                processed += 1;
                if (i + 1) % batch_size == 0 {
                    on_progress(Progress::new(processed, total, &file.name, ProgressStatus::Processing));
                    tokio::task::yield_now().await;
                }
            }

            self.persist(&mut run, &file.name, on_progress, processed, total).await;
        }

        // Retry whatever failed to write above before reporting completion.
        self.store
            .inner()
            .coalescer
            .force_flush(self.store.inner())
            .await?;

        let summary = run.summary();
        on_progress(Progress::new(total, total, "", ProgressStatus::Complete));
        info!(
            new = summary.new_count,
            updated = summary.updated_count,
            unique = summary.unique_count,
            skipped = summary.skipped_count,
            elapsed = ?started.elapsed(),
            "ingestion complete"
        );
        Ok(summary)
    }

    async fn persist<F>(&self, run: &mut MergeRun, file: &str, on_progress: &mut F, processed: usize, total: usize)
    where
        F: FnMut(Progress) + Send,
    {
        let staged = run.drain_staged();
        if staged.is_empty() {
            return;
        }

        let inner = self.store.inner();
        let batch_size = inner.config.ingest_batch_size().max(1);
        debug!(file, staged = staged.len(), "persisting staged records");

        let mut failed = 0;
        for (n, batch) in staged.chunks(batch_size).enumerate() {
            if n > 0 {
                tokio::task::yield_now().await;
            }
            let outcome = {
                let _flush_guard = inner.coalescer.exclusive().await;
                write_clean_batch(inner, batch).await
            };
            for id in outcome.failed {
                failed += 1;
                inner.cache.mark_dirty(id);
            }
            on_progress(Progress::new(processed, total, file, ProgressStatus::Persisting));
        }

        if failed > 0 {
            warn!(file, failed, "some records could not be written; they stay dirty for the next flush");
            run.failed_writes += failed;
            inner.coalescer.schedule(inner);
        }
    }
}
