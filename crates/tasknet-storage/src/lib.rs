pub mod backend;
pub mod memory;

#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use backend::{Result, StorageBackend, StorageError, StorageStats};
pub use memory::MemoryBackend;

#[cfg(feature = "rocksdb")]
pub use rocks::RocksBackend;
