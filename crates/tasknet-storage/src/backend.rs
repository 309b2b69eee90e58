use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Opaque key/value surface used for durable worker state.
///
/// Keys are UTF-8 strings so that callers can namespace them with prefixes
/// (`tasks:index`, `tasks:record:<id>`); values are raw bytes and the caller
/// owns their encoding.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store a value, overwriting any previous value under the same key
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Retrieve a value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Check if a key exists
    async fn has(&self, key: &str) -> Result<bool>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys starting with `prefix`, in lexicographic order
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Flush any pending writes
    async fn flush(&self) -> Result<()>;

    /// Get storage statistics
    async fn get_stats(&self) -> Result<StorageStats>;
}

#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub key_count: usize,
    pub total_size_bytes: Option<u64>,
}
