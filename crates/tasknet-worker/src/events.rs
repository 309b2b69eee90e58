//! Task lifecycle notifications.
//!
//! The surrounding node wires these to network broadcast and local
//! persistence triggers. A notification with no subscriber is dropped.

use crate::types::Task;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_NOTIFICATION_BUFFER: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskNotification {
    /// A task entered the unverified pool and needs a creation check
    VerifyNewTask(Task),
    /// A task passed verification and was persisted as in progress
    TaskVerified(Task),
    /// A task has its result attached
    TaskFinished(Task),
}

impl TaskNotification {
    pub fn name(&self) -> &'static str {
        match self {
            Self::VerifyNewTask(_) => "VERIFY_NEW_TASK",
            Self::TaskVerified(_) => "TASK_VERIFIED",
            Self::TaskFinished(_) => "TASK_FINISHED",
        }
    }

    pub fn task(&self) -> &Task {
        match self {
            Self::VerifyNewTask(task) | Self::TaskVerified(task) | Self::TaskFinished(task) => task,
        }
    }
}

#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<TaskNotification>,
    emitted: Arc<AtomicU64>,
}

impl NotificationBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender,
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.sender.subscribe()
    }

    pub fn emit(&self, notification: TaskNotification) {
        let name = notification.name();
        let task_id = notification.task().task_id;
        self.emitted.fetch_add(1, Ordering::Relaxed);

        match self.sender.send(notification) {
            Ok(subscribers) => {
                debug!(notification = name, task_id = %task_id, subscribers, "Notification emitted")
            }
            Err(_) => {
                debug!(notification = name, task_id = %task_id, "Notification emitted but no subscribers listening")
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_BUFFER)
    }
}
