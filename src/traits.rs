use async_trait::async_trait;
use serde_json::Value;

use crate::error::BackendError;

/// Key-value persistence service behind the record store.
///
/// Only per-key writes are expected to be atomic; there is no ordering or transactional guarantee across keys. The
/// store treats the backend as a best-effort durability target that may lag behind the in-memory cache.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError>;

    /// Idempotent write of a single key.
    async fn set(&self, key: &str, value: Value) -> Result<(), BackendError>;

    /// All keys currently held. Used only by the bulk loader.
    async fn keys(&self) -> Result<Vec<String>, BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn clear(&self) -> Result<(), BackendError>;
}
