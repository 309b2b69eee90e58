use crate::ledger::LedgerError;
use crate::types::{Address, TaskId, TaskStatus};
use tasknet_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Task already pending verification: {0}")]
    TaskAlreadyPending(TaskId),

    #[error("Task already exists: {0}")]
    TaskAlreadyExists(TaskId),

    /// A result arrived for a task that was never verified. This means the
    /// executor ran an unverified task and is always surfaced.
    #[error("Result received for unverified task: {0}")]
    UnverifiedTaskResult(TaskId),

    #[error("Result already attached to task: {0}")]
    ResultAlreadySet(TaskId),

    #[error("Invalid task state for {task_id}: expected {expected}, got {actual}")]
    InvalidTaskState {
        task_id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Execution error: {0}")]
    CoreError(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("{kind}: expected {expected} hex characters, got {actual}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{kind}: {reason}")]
    InvalidHex { kind: &'static str, reason: String },
}

/// Error taxonomy of verification outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Type,
    TaskValidity,
    TaskVerification,
    TaskFailed,
    WorkerSelectionVerification,
    Ledger,
    Cancelled,
}

/// Why a verification did not succeed. Carried inside `VerificationResult`,
/// never returned as `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("Type error: {0}")]
    Type(String),

    #[error("Task validity error: {0}")]
    TaskValidity(String),

    #[error("Task verification error: {field} mismatch (expected {expected}, got {actual})")]
    TaskVerification {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Task failed error: {0}")]
    TaskFailed(String),

    #[error("Worker selection verification error: selected {selected}, claimed {claimed}")]
    WorkerSelection { selected: Address, claimed: Address },

    #[error("Ledger read error: {0}")]
    Ledger(String),

    #[error("Verification cancelled for task {0}")]
    Cancelled(TaskId),
}

impl VerificationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Type(_) => ErrorKind::Type,
            Self::TaskValidity(_) => ErrorKind::TaskValidity,
            Self::TaskVerification { .. } => ErrorKind::TaskVerification,
            Self::TaskFailed(_) => ErrorKind::TaskFailed,
            Self::WorkerSelection { .. } => ErrorKind::WorkerSelectionVerification,
            Self::Ledger(_) => ErrorKind::Ledger,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn hash_mismatch(field: &str, expected: &[u8], actual: &[u8]) -> Self {
        Self::TaskVerification {
            field: field.to_string(),
            expected: format!("0x{}", hex::encode(expected)),
            actual: format!("0x{}", hex::encode(actual)),
        }
    }

    pub(crate) fn missing_commitment(field: &str, actual: &[u8]) -> Self {
        Self::TaskVerification {
            field: field.to_string(),
            expected: "<missing>".to_string(),
            actual: format!("0x{}", hex::encode(actual)),
        }
    }
}
