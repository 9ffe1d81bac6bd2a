use std::time::Duration;

use fieldx::fxstruct;

use crate::types::SourceSystem;

/// Tuning knobs of a [`RecordStore`](crate::RecordStore) and its ingestion pipeline.
///
/// ```ignore
/// let config = StoreConfig::builder()
///     .debounce(Duration::from_millis(50))
///     .flush_batch_size(500)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
#[fxstruct(no_new, builder, get(copy))]
pub struct StoreConfig {
    /// Quiet period after the last mutation before a coalesced flush starts.
    #[fieldx(default(Duration::from_millis(200)))]
    debounce: Duration,

    /// Records written concurrently per flush batch.
    #[fieldx(default(2000))]
    flush_batch_size: usize,

    /// Above this many stored keys the loader switches to chunked loading.
    #[fieldx(default(1000))]
    load_chunk_threshold: usize,

    #[fieldx(default(500))]
    load_chunk_size: usize,

    /// Staged records persisted per ingestion batch.
    #[fieldx(default(1000))]
    ingest_batch_size: usize,

    /// Cost deltas not exceeding this value in magnitude are not written.
    #[fieldx(default(1e-6))]
    merge_epsilon: f64,

    #[fieldx(default(Duration::from_secs(30 * 60)))]
    ingest_timeout: Duration,

    /// Budget of [`RecordStore::force_persist`](crate::RecordStore::force_persist).
    #[fieldx(default(Duration::from_secs(5 * 60)))]
    persist_timeout: Duration,

    /// Upper bound of consecutive rounds a forced flush runs while mutations keep arriving.
    #[fieldx(default(4))]
    max_flush_rounds: usize,

    /// Namespace of record keys in the backing store.
    #[fieldx(get(clone), default(String::from("record:")))]
    key_prefix: String,

    /// Wipe the backing store when it reports corruption during a load. This loses whatever was stored in favour of
    /// a usable, empty store.
    #[fieldx(default(true))]
    clear_on_corruption: bool,

    /// Source system of candidates that don't carry one and whose file doesn't name one.
    #[fieldx(default(SourceSystem::Aws))]
    default_source_system: SourceSystem,
}

impl StoreConfig {
    /// Configuration with every default in place.
    pub fn standard() -> Self {
        Self::builder()
            .build()
            .expect("all StoreConfig fields have defaults")
    }
}
