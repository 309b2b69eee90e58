//! Drives tasks through verification and execution.
//!
//! The controller listens to [`TaskManager`] notifications and, per task,
//! runs the creation check, hands verified tasks to the execution bridge
//! and verifies the returned result before it is persisted.

use crate::config::WorkerConfig;
use crate::error::{ErrorKind, Result, WorkerError};
use crate::events::TaskNotification;
use crate::ledger::{LedgerEventSource, LedgerReader};
use crate::task_manager::{TaskManager, TaskManagerConfig};
use crate::task_storage::TaskStore;
use crate::types::{Address, Task, TaskId, TaskResult, VerificationResult};
use crate::verifier::TaskVerifier;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tasknet_storage::{MemoryBackend, StorageBackend};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("Core unavailable: {0}")]
    Unavailable(String),

    #[error("Execution rejected: {0}")]
    Rejected(String),
}

/// Execution collaborator running tasks inside the enclave
#[async_trait]
pub trait CoreBridge: Send + Sync {
    async fn execute(&self, task: &Task) -> std::result::Result<TaskResult, CoreError>;
}

pub struct WorkerController {
    manager: Arc<TaskManager>,
    verifier: TaskVerifier,
    core: Arc<dyn CoreBridge>,
    worker_address: Address,
}

impl WorkerController {
    pub fn new(
        manager: Arc<TaskManager>,
        verifier: TaskVerifier,
        core: Arc<dyn CoreBridge>,
        worker_address: Address,
    ) -> Self {
        Self {
            manager,
            verifier,
            core,
            worker_address,
        }
    }

    /// Build every component from configuration and start the verifier
    pub async fn from_config(
        config: &WorkerConfig,
        reader: Arc<dyn LedgerReader>,
        events: Arc<dyn LedgerEventSource>,
        core: Arc<dyn CoreBridge>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| WorkerError::InvalidConfiguration(format!("{:#}", e)))?;
        let worker_address = config
            .worker_address()
            .map_err(|e| WorkerError::InvalidConfiguration(format!("{:#}", e)))?;

        let backend = open_backend(config)?;
        let store = Arc::new(TaskStore::new(backend));
        let manager = Arc::new(TaskManager::new(
            store,
            TaskManagerConfig::from(&config.tasks),
        ));
        let verifier = TaskVerifier::start(
            reader,
            events,
            config.epochs.window_capacity,
            config.verifier.clone(),
        )
        .await?;

        info!(
            worker_address = %worker_address,
            storage = %config.storage.backend,
            "🚀 Worker controller ready"
        );
        Ok(Self::new(manager, verifier, core, worker_address))
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub fn verifier(&self) -> &TaskVerifier {
        &self.verifier
    }

    /// Subscribe now, then process notifications and prune stale tasks in
    /// the background. The returned handle runs until aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let notifications = self.manager.subscribe();
        let controller = Arc::clone(self);
        let pruner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = controller.run(notifications) => {}
                _ = pruner.prune_periodically() => {}
            }
        })
    }

    async fn prune_periodically(self: Arc<Self>) {
        let every = self
            .manager
            .config()
            .prune_interval
            .max(Duration::from_millis(1));
        let mut prune_interval = interval(every);
        prune_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            prune_interval.tick().await;
            self.prune_expired().await;
        }
    }

    /// Evict stale unverified tasks and stop waiting on their ledger records
    pub async fn prune_expired(&self) -> Vec<TaskId> {
        let expired = self.manager.prune_expired().await;
        for task_id in &expired {
            if self.verifier.delete_task_creation_listener(task_id).await {
                debug!(task_id = %task_id, "Cancelled creation check of expired task");
            }
        }
        expired
    }

    pub async fn run(self: Arc<Self>, mut notifications: broadcast::Receiver<TaskNotification>) {
        loop {
            match notifications.recv().await {
                Ok(notification) => {
                    let controller = Arc::clone(&self);
                    tokio::spawn(async move { controller.dispatch(notification).await });
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "⚠️ Controller lagged behind task notifications");
                }
                Err(RecvError::Closed) => {
                    info!("Task notification channel closed, controller stopping");
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, notification: TaskNotification) {
        let name = notification.name();
        let outcome = match notification {
            TaskNotification::VerifyNewTask(task) => self.process_new_task(task).await.map(|_| ()),
            TaskNotification::TaskVerified(task) => {
                self.process_verified_task(task).await.map(|_| ())
            }
            TaskNotification::TaskFinished(task) => {
                debug!(task_id = %task.task_id, status = %task.status, "Task finished notification");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            error!(notification = name, error = %e, "❌ Task processing failed");
        }
    }

    /// Verify a newly admitted task and apply the outcome.
    ///
    /// A check still waiting from an earlier admission of the same id is
    /// cancelled first; the fresh admission owns the verification. A
    /// cancelled check leaves the pool alone.
    pub async fn process_new_task(&self, task: Task) -> Result<VerificationResult> {
        let task_id = task.task_id;
        if self.verifier.delete_task_creation_listener(&task_id).await {
            info!(task_id = %task_id, "♻️ Re-admitted task replaces pending creation check");
        }

        let outcome = self
            .verifier
            .verify_task_creation(task, &self.worker_address.to_string())
            .await
            .await;

        if outcome.error.as_ref().map(|e| e.kind()) == Some(ErrorKind::Cancelled) {
            debug!(task_id = %task_id, "Creation check cancelled, outcome not applied");
            return Ok(outcome);
        }

        self.manager
            .on_verify_task(&task_id, outcome.is_verified)
            .await?;
        Ok(outcome)
    }

    /// Execute a verified task, verify its result and persist it.
    ///
    /// Returns the finished task, or `None` if the result was rejected.
    pub async fn process_verified_task(&self, task: Task) -> Result<Option<Task>> {
        let task_id = task.task_id;
        let start = Instant::now();

        let result = self
            .core
            .execute(&task)
            .await
            .map_err(|e| WorkerError::CoreError(e.to_string()))?;
        debug!(
            task_id = %task_id,
            result = result.kind_name(),
            used_gas = result.used_gas,
            duration_ms = start.elapsed().as_millis() as u64,
            "⚙️ Task executed"
        );

        let outcome = self
            .verifier
            .verify_task_submission(result.clone(), task.contract_address)
            .await
            .await;

        if !outcome.is_verified {
            warn!(
                task_id = %task_id,
                error = ?outcome.error,
                "❌ Result rejected by ledger, not persisted"
            );
            return Ok(None);
        }

        let finished = self.manager.on_finish_task(result).await?;
        Ok(Some(finished))
    }
}

fn open_backend(config: &WorkerConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.storage.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryBackend::new())),
        #[cfg(feature = "rocksdb")]
        "rocksdb" => Ok(Arc::new(tasknet_storage::RocksBackend::new(
            &config.storage.path,
        )?)),
        other => Err(WorkerError::InvalidConfiguration(format!(
            "storage backend '{}' is not available in this build",
            other
        ))),
    }
}
