//! Contracts of the on-chain ledger this worker verifies against.
//!
//! The ledger is an external collaborator: point-in-time reads go through
//! [`LedgerReader`], pushed events through [`LedgerEventSource`].
//! [`MemoryLedger`] implements both in process.

use crate::types::{ContractAddress, EpochSnapshot, Hash, TaskId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown task status code: {0}")]
    UnknownStatus(u8),

    #[error("Contract not found: {0}")]
    ContractNotFound(ContractAddress),

    #[error("No epoch parameters published")]
    NoEpochs,

    #[error("Malformed ledger data: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Task status as the ledger contract enumerates it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LedgerTaskStatus {
    RecordUndefined = 0,
    RecordCreated = 1,
    ReceiptVerified = 2,
    ReceiptFailed = 3,
    ReceiptFailedEth = 4,
    ReceiptFailedReturn = 5,
}

impl LedgerTaskStatus {
    /// Any receipt recording that execution failed
    pub fn is_failure_receipt(&self) -> bool {
        matches!(
            self,
            Self::ReceiptFailed | Self::ReceiptFailedEth | Self::ReceiptFailedReturn
        )
    }
}

impl TryFrom<u8> for LedgerTaskStatus {
    type Error = LedgerError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::RecordUndefined),
            1 => Ok(Self::RecordCreated),
            2 => Ok(Self::ReceiptVerified),
            3 => Ok(Self::ReceiptFailed),
            4 => Ok(Self::ReceiptFailedEth),
            5 => Ok(Self::ReceiptFailedReturn),
            other => Err(LedgerError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for LedgerTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RecordUndefined => "RECORD_UNDEFINED",
            Self::RecordCreated => "RECORD_CREATED",
            Self::ReceiptVerified => "RECEIPT_VERIFIED",
            Self::ReceiptFailed => "RECEIPT_FAILED",
            Self::ReceiptFailedEth => "RECEIPT_FAILED_ETH",
            Self::ReceiptFailedReturn => "RECEIPT_FAILED_RETURN",
        };
        f.write_str(name)
    }
}

/// On-ledger record of one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub status: LedgerTaskStatus,
    pub inputs_hash: Hash,
    pub gas_limit: u64,
    pub block_number: Option<u64>,
    pub output_hash: Hash,
}

impl TaskRecord {
    /// What the ledger returns for a task it has never seen
    pub fn undefined() -> Self {
        Self {
            status: LedgerTaskStatus::RecordUndefined,
            inputs_hash: [0; 32],
            gas_limit: 0,
            block_number: None,
            output_hash: [0; 32],
        }
    }

    pub fn created(inputs_hash: Hash, gas_limit: u64, block_number: u64) -> Self {
        Self {
            status: LedgerTaskStatus::RecordCreated,
            inputs_hash,
            gas_limit,
            block_number: Some(block_number),
            output_hash: [0; 32],
        }
    }

    pub fn with_status(mut self, status: LedgerTaskStatus) -> Self {
        self.status = status;
        self
    }
}

/// Hash commitments of a deployed secret contract.
///
/// `delta_hashes[k]` commits to state version `k`; `output_hashes[k - 1]` to
/// the output of the task that produced it. Version 0 is the deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractParams {
    pub code_hash: Hash,
    pub delta_hashes: Vec<Hash>,
    pub output_hashes: Vec<Hash>,
}

/// Payload of a `TaskRecordCreated` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRecord {
    pub task_id: TaskId,
    pub inputs_hash: Hash,
    pub gas_limit: u64,
    pub block_number: u64,
}

/// Payload of a `ReceiptVerified` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedReceipt {
    pub task_id: TaskId,
    pub output_hash: Hash,
    pub delta_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    WorkersParameterized(EpochSnapshot),
    TaskRecordCreated(CreatedRecord),
    TaskRecordsCreated(Vec<CreatedRecord>),
    ReceiptVerified(VerifiedReceipt),
    ReceiptsVerified(Vec<VerifiedReceipt>),
    ReceiptFailed { task_id: TaskId },
    SecretContractDeployed {
        contract_address: ContractAddress,
        code_hash: Hash,
        initial_delta_hash: Hash,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> LedgerEventKind {
        match self {
            Self::WorkersParameterized(_) => LedgerEventKind::WorkersParameterized,
            Self::TaskRecordCreated(_) => LedgerEventKind::TaskRecordCreated,
            Self::TaskRecordsCreated(_) => LedgerEventKind::TaskRecordsCreated,
            Self::ReceiptVerified(_) => LedgerEventKind::ReceiptVerified,
            Self::ReceiptsVerified(_) => LedgerEventKind::ReceiptsVerified,
            Self::ReceiptFailed { .. } => LedgerEventKind::ReceiptFailed,
            Self::SecretContractDeployed { .. } => LedgerEventKind::SecretContractDeployed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerEventKind {
    WorkersParameterized,
    TaskRecordCreated,
    TaskRecordsCreated,
    ReceiptVerified,
    ReceiptsVerified,
    ReceiptFailed,
    SecretContractDeployed,
}

impl LedgerEventKind {
    pub const ALL: [LedgerEventKind; 7] = [
        Self::WorkersParameterized,
        Self::TaskRecordCreated,
        Self::TaskRecordsCreated,
        Self::ReceiptVerified,
        Self::ReceiptsVerified,
        Self::ReceiptFailed,
        Self::SecretContractDeployed,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkersParameterized => "WorkersParameterized",
            Self::TaskRecordCreated => "TaskRecordCreated",
            Self::TaskRecordsCreated => "TaskRecordsCreated",
            Self::ReceiptVerified => "ReceiptVerified",
            Self::ReceiptsVerified => "ReceiptsVerified",
            Self::ReceiptFailed => "ReceiptFailed",
            Self::SecretContractDeployed => "SecretContractDeployed",
        }
    }
}

/// Point-in-time reads of ledger state
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn get_task_params(&self, task_id: &TaskId) -> Result<TaskRecord>;

    async fn get_contract_params(&self, contract: &ContractAddress) -> Result<ContractParams>;

    /// The most recent epoch
    async fn get_epoch_params(&self) -> Result<EpochSnapshot>;

    /// Every epoch the ledger still retains, in storage order
    async fn get_all_epoch_params(&self) -> Result<Vec<EpochSnapshot>>;

    async fn get_epoch_size(&self) -> Result<u64>;
}

/// Push subscription to ledger events
#[async_trait]
pub trait LedgerEventSource: Send + Sync {
    async fn subscribe(
        &self,
        kinds: &[LedgerEventKind],
    ) -> Result<mpsc::UnboundedReceiver<LedgerEvent>>;
}

struct Subscriber {
    kinds: Vec<LedgerEventKind>,
    sender: mpsc::UnboundedSender<LedgerEvent>,
}

/// In-process ledger for tests and local development
pub struct MemoryLedger {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    contracts: RwLock<HashMap<ContractAddress, ContractParams>>,
    epochs: RwLock<Vec<EpochSnapshot>>,
    epoch_size: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
    unavailable: AtomicBool,
    task_reads: AtomicU64,
}

impl MemoryLedger {
    pub fn new(epoch_size: u64) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            contracts: RwLock::new(HashMap::new()),
            epochs: RwLock::new(Vec::new()),
            epoch_size: AtomicU64::new(epoch_size),
            subscribers: RwLock::new(Vec::new()),
            unavailable: AtomicBool::new(false),
            task_reads: AtomicU64::new(0),
        }
    }

    pub async fn set_task_record(&self, task_id: TaskId, record: TaskRecord) {
        self.tasks.write().await.insert(task_id, record);
    }

    pub async fn set_task_status(&self, task_id: &TaskId, status: LedgerTaskStatus) {
        let mut tasks = self.tasks.write().await;
        let record = tasks.entry(*task_id).or_insert_with(TaskRecord::undefined);
        record.status = status;
    }

    pub async fn set_contract_params(&self, contract: ContractAddress, params: ContractParams) {
        self.contracts.write().await.insert(contract, params);
    }

    /// Store epochs without emitting events, as if published before startup
    pub async fn set_epochs(&self, epochs: Vec<EpochSnapshot>) {
        *self.epochs.write().await = epochs;
    }

    /// Store a new epoch and announce it
    pub async fn publish_epoch(&self, epoch: EpochSnapshot) -> usize {
        self.epochs.write().await.push(epoch.clone());
        self.emit(LedgerEvent::WorkersParameterized(epoch)).await
    }

    pub fn set_epoch_size(&self, epoch_size: u64) {
        self.epoch_size.store(epoch_size, Ordering::SeqCst);
    }

    /// Make every read fail until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `get_task_params` calls served
    pub fn task_reads(&self) -> u64 {
        self.task_reads.load(Ordering::SeqCst)
    }

    /// Deliver an event to every matching subscriber, returning how many got it
    pub async fn emit(&self, event: LedgerEvent) -> usize {
        let kind = event.kind();
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !s.sender.is_closed());

        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|s| s.kinds.contains(&kind)) {
            if subscriber.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }

        debug!(event = kind.name(), delivered, "Ledger event emitted");
        delivered
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("memory ledger offline".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl LedgerReader for MemoryLedger {
    async fn get_task_params(&self, task_id: &TaskId) -> Result<TaskRecord> {
        self.task_reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self
            .tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_else(TaskRecord::undefined))
    }

    async fn get_contract_params(&self, contract: &ContractAddress) -> Result<ContractParams> {
        self.check_available()?;
        self.contracts
            .read()
            .await
            .get(contract)
            .cloned()
            .ok_or(LedgerError::ContractNotFound(*contract))
    }

    async fn get_epoch_params(&self) -> Result<EpochSnapshot> {
        self.check_available()?;
        self.epochs
            .read()
            .await
            .iter()
            .max_by_key(|e| e.first_block_number)
            .cloned()
            .ok_or(LedgerError::NoEpochs)
    }

    async fn get_all_epoch_params(&self) -> Result<Vec<EpochSnapshot>> {
        self.check_available()?;
        Ok(self.epochs.read().await.clone())
    }

    async fn get_epoch_size(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self.epoch_size.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl LedgerEventSource for MemoryLedger {
    async fn subscribe(
        &self,
        kinds: &[LedgerEventKind],
    ) -> Result<mpsc::UnboundedReceiver<LedgerEvent>> {
        self.check_available()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.write().await.push(Subscriber {
            kinds: kinds.to_vec(),
            sender,
        });
        Ok(receiver)
    }
}
