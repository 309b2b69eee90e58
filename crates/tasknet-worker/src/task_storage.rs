//! Durable storage of verified tasks.
//!
//! Layout over the key/value backend: a master index under [`INDEX_KEY`]
//! holding the ordered list of known task ids, and one bincode record per
//! task under `tasks:record:<hex id>`.

use crate::types::{Task, TaskId};
use std::sync::Arc;
use tasknet_storage::{StorageBackend, StorageError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub type Result<T> = std::result::Result<T, StorageError>;

pub const INDEX_KEY: &str = "tasks:index";
const RECORD_PREFIX: &str = "tasks:record:";

pub struct TaskStore {
    backend: Arc<dyn StorageBackend>,
    // Serializes read-modify-write of the index
    index_lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            index_lock: Mutex::new(()),
        }
    }

    fn record_key(task_id: &TaskId) -> String {
        format!("{}{}", RECORD_PREFIX, hex::encode(task_id.as_bytes()))
    }

    /// Persist a new task: write its record, then append its id to the index
    pub async fn insert(&self, task: &Task) -> Result<()> {
        let _guard = self.index_lock.lock().await;

        self.write_record(task).await?;

        let mut index = self.read_index().await?;
        if !index.contains(&task.task_id) {
            index.push(task.task_id);
            self.write_index(&index).await?;
        }

        debug!(task_id = %task.task_id, index_len = index.len(), "💾 Task persisted");
        Ok(())
    }

    /// Overwrite the record of a task that is already indexed
    pub async fn update(&self, task: &Task) -> Result<()> {
        if !self.contains(&task.task_id).await? {
            return Err(StorageError::NotFound(task.task_id.to_string()));
        }
        self.write_record(task).await
    }

    /// Indexed task by id. A record left behind by a failed removal is not
    /// returned.
    pub async fn get(&self, task_id: &TaskId) -> Result<Option<Task>> {
        if !self.contains(task_id).await? {
            return Ok(None);
        }
        self.read_record(task_id).await
    }

    /// Whether the index lists `task_id`
    pub async fn contains(&self, task_id: &TaskId) -> Result<bool> {
        Ok(self.read_index().await?.contains(task_id))
    }

    /// Remove a task: drop it from the index first, then delete its record.
    ///
    /// If the record delete fails the index update stays applied. Lookups go
    /// through the index, so the dangling record reads as missing and a
    /// dangling index entry reads as missing too.
    pub async fn remove(&self, task_id: &TaskId) -> Result<bool> {
        let _guard = self.index_lock.lock().await;

        let mut index = self.read_index().await?;
        let before = index.len();
        index.retain(|id| id != task_id);
        let indexed = index.len() != before;
        if indexed {
            self.write_index(&index).await?;
        }

        self.backend.delete(&Self::record_key(task_id)).await?;

        debug!(task_id = %task_id, indexed, "🗑️ Task removed from storage");
        Ok(indexed)
    }

    pub async fn task_ids(&self) -> Result<Vec<TaskId>> {
        self.read_index().await
    }

    /// Every indexed task, in index order. Index entries without a record
    /// are skipped.
    pub async fn all(&self) -> Result<Vec<Task>> {
        let index = self.read_index().await?;
        let mut tasks = Vec::with_capacity(index.len());
        for task_id in &index {
            match self.read_record(task_id).await? {
                Some(task) => tasks.push(task),
                None => warn!(task_id = %task_id, "Index entry without a task record"),
            }
        }
        Ok(tasks)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.read_index().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.read_index().await?.is_empty())
    }

    async fn read_index(&self) -> Result<Vec<TaskId>> {
        match self.backend.get(INDEX_KEY).await? {
            Some(data) => bincode::deserialize(&data).map_err(|e| {
                StorageError::SerializationError(format!("Failed to deserialize task index: {}", e))
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn write_index(&self, index: &[TaskId]) -> Result<()> {
        let data = bincode::serialize(index).map_err(|e| {
            StorageError::SerializationError(format!("Failed to serialize task index: {}", e))
        })?;
        self.backend.put(INDEX_KEY, &data).await
    }

    async fn read_record(&self, task_id: &TaskId) -> Result<Option<Task>> {
        let Some(data) = self.backend.get(&Self::record_key(task_id)).await? else {
            return Ok(None);
        };

        let task: Task = bincode::deserialize(&data).map_err(|e| {
            StorageError::SerializationError(format!("Failed to deserialize task: {}", e))
        })?;
        Ok(Some(task))
    }

    async fn write_record(&self, task: &Task) -> Result<()> {
        let data = bincode::serialize(task).map_err(|e| {
            StorageError::SerializationError(format!("Failed to serialize task: {}", e))
        })?;
        self.backend.put(&Self::record_key(&task.task_id), &data).await
    }
}
