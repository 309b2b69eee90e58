/*!
# tasknet worker: task verification and lifecycle

A worker in a confidential-computation network runs tasks off-chain and has
to prove against the on-chain ledger that it was the elected executor and
that its result matches the commitments the ledger recorded.

## Module Structure

- **types**: Task, TaskResult, EpochSnapshot, identifiers, VerificationResult
- **hashing**: Keccak-256 and the ledger's ABI encoding for selection draws
- **worker_selection**: stake-weighted deterministic election
- **epoch_window**: bounded cache of recent epochs, looked up by block number
- **pending**: single-shot continuation registry and `VerificationHandle`
- **ledger**: ledger reader / event source contracts plus `MemoryLedger`
- **verifier**: creation and submission checks racing ledger reads against events
- **task_storage**: durable index + record layout over a `StorageBackend`
- **task_manager**: unverified pool, state machine and lifecycle notifications
- **controller**: wires notifications to verification and execution
- **config** / **logging**: TOML configuration and tracing setup

## Task Lifecycle

```text
add_unverified          (pool only, VERIFY_NEW_TASK)
    ↓ verify_task_creation: ledger record + elected worker
InProgress              (persisted, TASK_VERIFIED)
    ↓ execution, then verify_task_submission: output/delta hashes
Success | Failed        (result attached once, TASK_FINISHED)
```

## Worker Selection

```text
total = Σ balances
r     = uint256(keccak256(seed ‖ contract ‖ nonce)) mod total
winner = first worker i with r - Σ_{j≤i} balance_j <= 0
```

Duplicates advance the nonce until the group is full.
*/

pub mod config;
pub mod controller;
pub mod epoch_window;
pub mod error;
pub mod events;
pub mod hashing;
pub mod ledger;
pub mod logging;
pub mod pending;
pub mod task_manager;
pub mod task_storage;
pub mod types;
pub mod verifier;
pub mod worker_selection;

pub use config::{LoggingConfig, VerifierConfig, WorkerConfig};
pub use controller::{CoreBridge, CoreError, WorkerController};
pub use epoch_window::EpochParameterWindow;
pub use error::{ErrorKind, IdentifierError, Result, VerificationError, WorkerError};
pub use events::{NotificationBus, TaskNotification};
pub use ledger::{
    ContractParams, CreatedRecord, LedgerError, LedgerEvent, LedgerEventKind, LedgerEventSource,
    LedgerReader, LedgerTaskStatus, MemoryLedger, TaskRecord, VerifiedReceipt,
};
pub use pending::{PendingRegistry, VerificationHandle};
pub use task_manager::{TaskManager, TaskManagerConfig, TaskStats};
pub use task_storage::TaskStore;
pub use types::*;
pub use verifier::TaskVerifier;
pub use worker_selection::{select_group, select_worker, SelectionError, MAX_SELECTION_ROUNDS};
