//! Bundled [`BackingStore`](crate::traits::BackingStore) adapters.

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;
