use crate::config::{TaskConfig, DEFAULT_PRUNE_INTERVAL_SECS};
use crate::error::{Result, WorkerError};
use crate::events::{NotificationBus, TaskNotification, DEFAULT_NOTIFICATION_BUFFER};
use crate::task_storage::TaskStore;
use crate::types::{Task, TaskId, TaskResult, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// How long an unverified task stays alive in the pool
    pub unverified_ttl: Duration,
    pub notification_buffer: usize,
    /// How often the controller evicts stale pool entries
    pub prune_interval: std::time::Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            unverified_ttl: Duration::hours(24),
            notification_buffer: DEFAULT_NOTIFICATION_BUFFER,
            prune_interval: std::time::Duration::from_secs(DEFAULT_PRUNE_INTERVAL_SECS),
        }
    }
}

impl From<&TaskConfig> for TaskManagerConfig {
    fn from(config: &TaskConfig) -> Self {
        Self {
            unverified_ttl: config.unverified_ttl(),
            notification_buffer: config.notification_buffer,
            prune_interval: config.prune_interval(),
        }
    }
}

struct PoolEntry {
    task: Task,
    admitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub unverified: usize,
    pub in_progress: usize,
    pub success: usize,
    pub failed: usize,
}

/// Task lifecycle: `Unverified -> InProgress -> Success | Failed`.
///
/// Unverified tasks live only in the in-memory pool; a task reaches durable
/// storage once it is verified.
pub struct TaskManager {
    store: Arc<TaskStore>,
    pool: Arc<RwLock<HashMap<TaskId, PoolEntry>>>,
    finish_lock: Mutex<()>,
    notifications: NotificationBus,
    config: TaskManagerConfig,
}

impl TaskManager {
    pub fn new(store: Arc<TaskStore>, config: TaskManagerConfig) -> Self {
        Self {
            store,
            pool: Arc::new(RwLock::new(HashMap::new())),
            finish_lock: Mutex::new(()),
            notifications: NotificationBus::new(config.notification_buffer),
            config,
        }
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.notifications.subscribe()
    }

    /// Admit a task into the unverified pool and request its verification
    pub async fn add_unverified(&self, task: Task) -> Result<()> {
        self.admit(task, Utc::now()).await
    }

    async fn admit(&self, task: Task, admitted_at: DateTime<Utc>) -> Result<()> {
        let task_id = task.task_id;
        if task.status != TaskStatus::Unverified {
            return Err(WorkerError::InvalidTaskState {
                task_id,
                expected: TaskStatus::Unverified,
                actual: task.status,
            });
        }

        {
            let mut pool = self.pool.write().await;
            if let Some(existing) = pool.get(&task_id) {
                if self.is_alive(existing, Utc::now()) {
                    return Err(WorkerError::TaskAlreadyPending(task_id));
                }
                debug!(task_id = %task_id, "Replacing stale unverified task");
            }

            if self.store.contains(&task_id).await? {
                return Err(WorkerError::TaskAlreadyExists(task_id));
            }

            pool.insert(
                task_id,
                PoolEntry {
                    task: task.clone(),
                    admitted_at,
                },
            );
        }

        info!(
            task_id = %task_id,
            kind = task.kind_name(),
            gas_limit = task.gas_limit,
            "📋 Task admitted for verification"
        );
        self.notifications.emit(TaskNotification::VerifyNewTask(task));
        Ok(())
    }

    /// Apply a creation verification outcome.
    ///
    /// Verified tasks move to `InProgress` and are persisted; rejected tasks
    /// are dropped from the pool. A task no longer in the pool, or past its
    /// TTL, is ignored.
    pub async fn on_verify_task(&self, task_id: &TaskId, is_verified: bool) -> Result<()> {
        let Some(entry) = self.pool.write().await.remove(task_id) else {
            info!(task_id = %task_id, "Verification outcome for task not in pool, ignoring");
            return Ok(());
        };

        if !self.is_alive(&entry, Utc::now()) {
            info!(
                task_id = %task_id,
                is_verified,
                "⏳ Verification outcome for expired task, dropping it"
            );
            return Ok(());
        }

        if !is_verified {
            info!(task_id = %task_id, "🗑️ Unverified task dropped");
            return Ok(());
        }

        let mut task = entry.task;
        task.status = TaskStatus::InProgress;

        if let Err(e) = self.store.insert(&task).await {
            // Back into the pool so the outcome can be applied again
            let mut restored = task;
            restored.status = TaskStatus::Unverified;
            self.pool.write().await.insert(
                *task_id,
                PoolEntry {
                    task: restored,
                    admitted_at: entry.admitted_at,
                },
            );
            return Err(e.into());
        }

        info!(
            task_id = %task_id,
            kind = task.kind_name(),
            pending_ms = (Utc::now() - entry.admitted_at).num_milliseconds(),
            "✅ Task verified, in progress"
        );
        self.notifications.emit(TaskNotification::TaskVerified(task));
        Ok(())
    }

    /// Attach an execution result to a verified task and persist it.
    ///
    /// A result for a task that was never verified means the executor ran
    /// an unverified task. That is always an error and storage is left
    /// untouched.
    pub async fn on_finish_task(&self, result: TaskResult) -> Result<Task> {
        let task_id = result.task_id;
        let _guard = self.finish_lock.lock().await;

        if self.pool.read().await.contains_key(&task_id) {
            error!(task_id = %task_id, "🚨 Result received for task still awaiting verification");
            return Err(WorkerError::UnverifiedTaskResult(task_id));
        }

        let Some(mut task) = self.store.get(&task_id).await? else {
            error!(task_id = %task_id, "🚨 Result received for task that was never verified");
            return Err(WorkerError::UnverifiedTaskResult(task_id));
        };

        if task.result.is_some() {
            return Err(WorkerError::ResultAlreadySet(task_id));
        }

        let next = result.status();
        if !task.status.can_transition_to(&next) {
            return Err(WorkerError::InvalidTaskState {
                task_id,
                expected: TaskStatus::InProgress,
                actual: task.status,
            });
        }

        task.status = next;
        task.result = Some(result);
        self.store.update(&task).await?;

        info!(
            task_id = %task_id,
            status = %task.status,
            "🏁 Task finished"
        );
        self.notifications
            .emit(TaskNotification::TaskFinished(task.clone()));
        Ok(task)
    }

    /// Remove a task from the pool, or from durable storage if not pooled
    pub async fn remove_task(&self, task_id: &TaskId) -> Result<bool> {
        if self.pool.write().await.remove(task_id).is_some() {
            debug!(task_id = %task_id, "Unverified task removed from pool");
            return Ok(true);
        }
        Ok(self.store.remove(task_id).await?)
    }

    /// Whether a pooled task is still within its TTL
    pub async fn is_keep_alive(&self, task_id: &TaskId) -> bool {
        let now = Utc::now();
        self.pool
            .read()
            .await
            .get(task_id)
            .map(|entry| self.is_alive(entry, now))
            .unwrap_or(false)
    }

    /// Evict stale pool entries, returning their ids
    pub async fn prune_expired(&self) -> Vec<TaskId> {
        let now = Utc::now();
        let mut pool = self.pool.write().await;
        let expired: Vec<TaskId> = pool
            .iter()
            .filter(|(_, entry)| !self.is_alive(entry, now))
            .map(|(id, _)| *id)
            .collect();

        for task_id in &expired {
            pool.remove(task_id);
        }
        if !expired.is_empty() {
            warn!(count = expired.len(), "⏳ Evicted stale unverified tasks");
        }
        expired
    }

    fn is_alive(&self, entry: &PoolEntry, now: DateTime<Utc>) -> bool {
        now - entry.admitted_at < self.config.unverified_ttl
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        if let Some(entry) = self.pool.read().await.get(task_id) {
            return Ok(Some(entry.task.clone()));
        }
        Ok(self.store.get(task_id).await?)
    }

    /// Pool tasks followed by stored tasks in index order
    pub async fn get_all_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = self.get_unverified_tasks().await;
        tasks.extend(self.store.all().await?);
        Ok(tasks)
    }

    pub async fn get_unverified_tasks(&self) -> Vec<Task> {
        self.pool
            .read()
            .await
            .values()
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub async fn get_verified_tasks(&self) -> Result<Vec<Task>> {
        self.stored_where(|task| task.status == TaskStatus::InProgress)
            .await
    }

    pub async fn get_finished_tasks(&self) -> Result<Vec<Task>> {
        self.stored_where(Task::is_finished).await
    }

    pub async fn get_failed_tasks(&self) -> Result<Vec<Task>> {
        self.stored_where(|task| task.status == TaskStatus::Failed)
            .await
    }

    pub async fn get_successful_tasks(&self) -> Result<Vec<Task>> {
        self.stored_where(|task| task.status == TaskStatus::Success)
            .await
    }

    async fn stored_where(&self, predicate: impl Fn(&Task) -> bool) -> Result<Vec<Task>> {
        Ok(self
            .store
            .all()
            .await?
            .into_iter()
            .filter(|task| predicate(task))
            .collect())
    }

    pub async fn stats(&self) -> Result<TaskStats> {
        let mut stats = TaskStats {
            unverified: self.pool.read().await.len(),
            ..TaskStats::default()
        };
        for task in self.store.all().await? {
            match task.status {
                TaskStatus::Unverified => stats.unverified += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Success => stats.success += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
