use crate::error::VerificationError;
use crate::types::{TaskId, VerificationResult};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// A registered caller waiting on one task's verification outcome.
///
/// Owning the entry is owning the right to answer the caller: whoever
/// takes it out of the registry resolves it, and nobody else can.
pub struct PendingVerification<C> {
    pub context: C,
    sender: oneshot::Sender<VerificationResult>,
    registered_at: Instant,
}

impl<C> PendingVerification<C> {
    /// Answer the waiting caller. Returns false if the caller dropped its handle.
    pub fn resolve(self, result: VerificationResult) -> bool {
        self.sender.send(result).is_ok()
    }

    pub fn waited(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

/// Table of single-shot continuations keyed by task id.
///
/// Creation and submission verifications each get their own registry so the
/// two flows for one task never collide.
pub struct PendingRegistry<C> {
    name: &'static str,
    entries: Arc<Mutex<HashMap<TaskId, PendingVerification<C>>>>,
}

impl<C> PendingRegistry<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arm a continuation for `task_id`. Returns `None` if one is already
    /// armed; the existing entry is left untouched.
    pub async fn register(
        &self,
        task_id: TaskId,
        context: C,
    ) -> Option<oneshot::Receiver<VerificationResult>> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&task_id) {
            return None;
        }

        let (sender, receiver) = oneshot::channel();
        entries.insert(
            task_id,
            PendingVerification {
                context,
                sender,
                registered_at: Instant::now(),
            },
        );

        debug!(registry = self.name, task_id = %task_id, pending = entries.len(), "Listener armed");
        Some(receiver)
    }

    /// Atomic check-and-delete: the caller that gets `Some` is the only one
    /// allowed to resolve this entry.
    pub async fn take(&self, task_id: &TaskId) -> Option<PendingVerification<C>> {
        let taken = self.entries.lock().await.remove(task_id);
        if taken.is_some() {
            debug!(registry = self.name, task_id = %task_id, "Listener claimed");
        }
        taken
    }

    /// Drop the entry without answering; the handle then resolves as cancelled
    pub async fn cancel(&self, task_id: &TaskId) -> bool {
        let removed = self.entries.lock().await.remove(task_id).is_some();
        if removed {
            debug!(registry = self.name, task_id = %task_id, "Listener deleted");
        }
        removed
    }

    pub async fn contains(&self, task_id: &TaskId) -> bool {
        self.entries.lock().await.contains_key(task_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl<C> Clone for PendingRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            entries: Arc::clone(&self.entries),
        }
    }
}

enum HandleState {
    Waiting(oneshot::Receiver<VerificationResult>),
    Ready(Option<VerificationResult>),
}

/// Future of a verification outcome. It may already be resolved when
/// returned, or stay pending until the ledger catches up.
pub struct VerificationHandle {
    task_id: TaskId,
    state: HandleState,
}

impl VerificationHandle {
    pub(crate) fn waiting(task_id: TaskId, receiver: oneshot::Receiver<VerificationResult>) -> Self {
        Self {
            task_id,
            state: HandleState::Waiting(receiver),
        }
    }

    pub(crate) fn ready(task_id: TaskId, result: VerificationResult) -> Self {
        Self {
            task_id,
            state: HandleState::Ready(Some(result)),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Future for VerificationHandle {
    type Output = VerificationResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let task_id = this.task_id;
        match &mut this.state {
            HandleState::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                VerificationResult::rejected(VerificationError::Cancelled(task_id))
            })),
            HandleState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(VerificationResult::rejected(
                    VerificationError::Cancelled(task_id),
                )),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
