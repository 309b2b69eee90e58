use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, DB};
use tracing::info;

use crate::backend::{Result, StorageBackend, StorageError, StorageStats};

/// RocksDB-backed durable store
pub struct RocksBackend {
    db: Arc<DB>,
}

impl RocksBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        // Task records are small and written rarely
        opts.set_write_buffer_size(16 * 1024 * 1024);
        opts.set_max_write_buffer_number(2);
        opts.set_max_background_jobs(2);

        Self::with_options(path, opts)
    }

    pub fn with_options<P: AsRef<Path>>(path: P, opts: Options) -> Result<Self> {
        let db = DB::open(&opts, path.as_ref())
            .map_err(|e| StorageError::BackendError(format!("Failed to open RocksDB: {}", e)))?;

        info!(path = %path.as_ref().display(), "🗄️ RocksDB opened");

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl StorageBackend for RocksBackend {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| StorageError::BackendError(format!("RocksDB put error: {}", e)))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key.as_bytes())
            .map_err(|e| StorageError::BackendError(format!("RocksDB get error: {}", e)))
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.db
            .get(key.as_bytes())
            .map(|v| v.is_some())
            .map_err(|e| StorageError::BackendError(format!("RocksDB has error: {}", e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db
            .delete(key.as_bytes())
            .map_err(|e| StorageError::BackendError(format!("RocksDB delete error: {}", e)))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        let mut keys = Vec::new();

        for item in iter {
            let (key, _) =
                item.map_err(|e| StorageError::BackendError(format!("Iterator error: {}", e)))?;

            if !key.starts_with(prefix.as_bytes()) {
                break;
            }

            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            keys.push(key);
        }

        Ok(keys)
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| StorageError::BackendError(format!("RocksDB flush error: {}", e)))
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let key_count = self
            .db
            .property_int_value("rocksdb.estimate-num-keys")
            .map_err(|e| StorageError::BackendError(e.to_string()))?
            .unwrap_or(0) as usize;
        let total_size_bytes = self
            .db
            .property_int_value("rocksdb.total-sst-files-size")
            .map_err(|e| StorageError::BackendError(e.to_string()))?;

        Ok(StorageStats {
            key_count,
            total_size_bytes,
        })
    }
}
