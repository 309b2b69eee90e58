use crate::epoch_window::DEFAULT_WINDOW_CAPACITY;
use crate::types::Address;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_UNVERIFIED_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub node: NodeSettings,
    pub epochs: EpochConfig,
    pub verifier: VerifierConfig,
    pub tasks: TaskConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Address this worker claims when checking its own election
    pub worker_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochConfig {
    pub window_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    pub verify_inputs_hash: bool,
    pub group_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub unverified_ttl_secs: u64,
    pub notification_buffer: usize,
    /// How often stale unverified tasks are evicted
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_prune_interval_secs() -> u64 {
    DEFAULT_PRUNE_INTERVAL_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file_output: Option<PathBuf>,
    #[serde(default)]
    pub module_filters: HashMap<String, String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            verify_inputs_hash: true,
            group_size: 1,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            unverified_ttl_secs: DEFAULT_UNVERIFIED_TTL_SECS,
            notification_buffer: 1000,
            prune_interval_secs: DEFAULT_PRUNE_INTERVAL_SECS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_output: None,
            module_filters: HashMap::new(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                worker_address: format!("0x{}", "00".repeat(Address::LEN)),
            },
            epochs: EpochConfig {
                window_capacity: DEFAULT_WINDOW_CAPACITY,
            },
            verifier: VerifierConfig::default(),
            tasks: TaskConfig::default(),
            storage: StorageConfig {
                backend: "memory".to_string(),
                path: PathBuf::from("./data/tasks"),
            },
            logging: LoggingConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = env::var("TASKNET_WORKER_ADDRESS") {
            if !address.is_empty() {
                self.node.worker_address = address;
            }
        }
        if let Ok(level) = env::var("TASKNET_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(path) = env::var("TASKNET_STORAGE_PATH") {
            if !path.is_empty() {
                self.storage.path = PathBuf::from(path);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.worker_address()?;
        if self.epochs.window_capacity == 0 {
            bail!("epochs.window_capacity must be at least 1");
        }
        if self.verifier.group_size == 0 {
            bail!("verifier.group_size must be at least 1");
        }
        if self.tasks.unverified_ttl_secs == 0 {
            bail!("tasks.unverified_ttl_secs must be positive");
        }
        if self.tasks.prune_interval_secs == 0 {
            bail!("tasks.prune_interval_secs must be positive");
        }
        match self.storage.backend.as_str() {
            "memory" | "rocksdb" => {}
            other => bail!("unknown storage backend '{}'", other),
        }
        Ok(())
    }

    pub fn worker_address(&self) -> Result<Address> {
        self.node
            .worker_address
            .parse::<Address>()
            .with_context(|| format!("node.worker_address '{}'", self.node.worker_address))
    }
}

impl TaskConfig {
    pub fn unverified_ttl(&self) -> chrono::Duration {
        // chrono caps durations at i64::MAX milliseconds
        let secs = self.unverified_ttl_secs.min(i64::MAX as u64 / 1000);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn prune_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.prune_interval_secs)
    }
}
