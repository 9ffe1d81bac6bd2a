//! # record-store
//!
//! Bulk ingestion and write-coalescing record store for cost/inventory records parsed out of cloud billing exports.
//!
//! Think of it as an authoritative in-memory table with a lazy, batched mirror in a slow key-value store.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Tens of thousands of records arrive in bursts, typically from several export files at once.
//! - The same resource shows up more than once, within a file and across files, and has to be merged, not duplicated.
//! - The backing key-value store is slow per operation, so one write per mutation is out of the question.
//!
//! The store operates on the following principles:
//!
//! - The in-memory cache is the source of truth for a session. The backing store follows it with a delay of at most
//!   one debounce interval or one in-flight flush.
//! - It is backend-agnostic: anything implementing [`BackingStore`] will do. [`MemoryStore`] and [`FsStore`] come with
//!   the crate.
//! - The cache is populated from the backing store once, lazily, on the first access that needs the full record set.
//! - Mutations are coalesced: a debounce timer turns a burst of `save_one`/`delete` calls into a single flush round.
//! - Fully async, built on [tokio](https://crates.io/crates/tokio) and [moka](https://crates.io/crates/moka).
//!
//! # Components
//!
//! - **Record cache** keeps every record keyed by id, plus the set of ids mutated since the last flush.
//! - **Write coalescer** flushes a snapshot of the cache in bounded concurrent batches after a quiet period. Only one
//!   flush runs at a time; a debounced flush arriving while another one is running is dropped.
//! - **Bulk loader** reads every stored record once per cache lifetime, in chunks when there are many. A store that
//!   reports corruption while listing its keys is wiped, which loses its content; this is logged as an error.
//! - **Ingestion pipeline** ([`IngestPipeline`]) merges candidate rows into existing records by a composite dedupe key
//!   and persists the result file by file.
//!
//! # Deduplication And Merging
//!
//! A candidate's identity is its normalized resource id, service label, and region joined with `|`; see
//! [`dedupe_key`](record::dedupe_key). When a candidate matches a stored record its monthly cost is **added** to the
//! stored cost. Merging is additive across files and across runs: importing the same export twice doubles the costs
//! it covers. Changes within [`merge_epsilon`](StoreConfig::merge_epsilon) are not written at all.
//!
//! # Usage
//!
//! ```ignore
//! let backend = Arc::new(FsStore::open("./records").await?);
//! let store = RecordStore::open(backend, StoreConfig::standard());
//! let pipeline = IngestPipeline::new(store.clone());
//!
//! let summary = pipeline
//!     .ingest(candidates, |progress| println!("{:>5.1}% {}", progress.percent, progress.current_item))
//!     .await?;
//! println!("{} new, {} updated", summary.new_count, summary.updated_count);
//!
//! store.close().await?;
//! ```
//!
//! # Crate Features
//!
//! - `cli` builds the `record-ingest` binary that imports JSON-lines files into a directory-backed store.

pub mod backend;
pub(crate) mod cache;
pub mod candidate;
#[cfg(feature = "cli")]
pub mod cli;
pub(crate) mod coalescer;
pub mod config;
pub mod error;
pub mod ingest;
pub(crate) mod loader;
pub mod record;
pub mod store;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use backend::FsStore;
#[doc(inline)]
pub use backend::MemoryStore;
#[doc(inline)]
pub use config::StoreConfig;
#[doc(inline)]
pub use error::StoreError;
#[doc(inline)]
pub use ingest::IngestPipeline;
#[doc(inline)]
pub use record::Record;
#[doc(inline)]
pub use store::RecordStore;
#[doc(inline)]
pub use traits::BackingStore;

pub mod prelude {
    pub use crate::backend::FsStore;
    pub use crate::backend::MemoryStore;
    pub use crate::candidate::CandidateRecord;
    pub use crate::candidate::SourceFile;
    pub use crate::config::StoreConfig;
    pub use crate::error::BackendError;
    pub use crate::error::StoreError;
    pub use crate::ingest::IngestPipeline;
    pub use crate::record::Record;
    pub use crate::record::RecordDraft;
    pub use crate::store::RecordStore;
    pub use crate::traits::BackingStore;
    pub use crate::types::*;
}
