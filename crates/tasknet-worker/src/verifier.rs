//! Ledger-backed verification of task creations and submissions.
//!
//! Every verification races two sources: a point-in-time ledger read spawned
//! when the caller registers, and the ledger event stream. Both race to take
//! the caller's entry out of a [`PendingRegistry`]; the winner answers and
//! the loser finds nothing.

use crate::config::VerifierConfig;
use crate::epoch_window::EpochParameterWindow;
use crate::error::{Result, VerificationError};
use crate::hashing::keccak256;
use crate::ledger::{
    ContractParams, CreatedRecord, LedgerEvent, LedgerEventKind, LedgerEventSource, LedgerReader,
    LedgerTaskStatus, VerifiedReceipt,
};
use crate::pending::{PendingRegistry, PendingVerification, VerificationHandle};
use crate::types::{
    Address, ContractAddress, Hash, ResultKind, Task, TaskId, TaskResult, VerificationResult,
};
use crate::worker_selection::select_group;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ALREADY_PENDING: &str = "verification already pending";
const EPOCH_PARAMS_MISSING: &str = "epoch params missing";
const TASK_DID_NOT_FAIL: &str = "task did not fail";

/// Context kept with a pending creation check
pub struct CreationRequest {
    pub task: Task,
    pub worker: Address,
}

/// Context kept with a pending submission check
pub struct SubmissionRequest {
    pub result: TaskResult,
    pub contract: ContractAddress,
}

#[derive(Clone)]
pub struct TaskVerifier {
    reader: Arc<dyn LedgerReader>,
    window: Arc<EpochParameterWindow>,
    creations: PendingRegistry<CreationRequest>,
    submissions: PendingRegistry<SubmissionRequest>,
    config: VerifierConfig,
}

impl TaskVerifier {
    pub fn new(
        reader: Arc<dyn LedgerReader>,
        window: Arc<EpochParameterWindow>,
        config: VerifierConfig,
    ) -> Self {
        Self {
            reader,
            window,
            creations: PendingRegistry::new("creation"),
            submissions: PendingRegistry::new("submission"),
            config,
        }
    }

    /// Subscribe to the ledger, load the epoch window and start dispatching
    /// events. The dispatcher stops when the subscription closes.
    pub async fn start(
        reader: Arc<dyn LedgerReader>,
        events: Arc<dyn LedgerEventSource>,
        window_capacity: usize,
        config: VerifierConfig,
    ) -> Result<Self> {
        let window = Arc::new(EpochParameterWindow::new(window_capacity));
        let verifier = Self::new(reader, window, config);

        // Subscribe before reading so no epoch published in between is lost
        let mut receiver = events.subscribe(&LedgerEventKind::ALL).await?;

        let epoch_size = verifier.reader.get_epoch_size().await?;
        let epochs = verifier.reader.get_all_epoch_params().await?;
        verifier.window.bootstrap(epochs, epoch_size).await;

        let dispatcher = verifier.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                dispatcher.handle_event(event).await;
            }
            info!("🔌 Ledger subscription closed, event dispatch stopped");
        });

        info!(
            window_capacity,
            group_size = verifier.config.group_size,
            verify_inputs_hash = verifier.config.verify_inputs_hash,
            "🚀 Task verifier started"
        );
        Ok(verifier)
    }

    pub fn window(&self) -> &Arc<EpochParameterWindow> {
        &self.window
    }

    pub async fn pending_creation_count(&self) -> usize {
        self.creations.len().await
    }

    pub async fn pending_submission_count(&self) -> usize {
        self.submissions.len().await
    }

    /// Check that `task` is recorded on the ledger and that `worker_address`
    /// was elected to run it.
    ///
    /// Resolves immediately on malformed input or a duplicate registration,
    /// otherwise when the ledger read or a `TaskRecordCreated` event settles
    /// it. A task the ledger has not seen yet keeps the handle pending.
    pub async fn verify_task_creation(&self, task: Task, worker_address: &str) -> VerificationHandle {
        let task_id = task.task_id;

        let worker = match worker_address.parse::<Address>() {
            Ok(worker) => worker,
            Err(e) => {
                warn!(task_id = %task_id, worker_address, error = %e, "❌ Invalid worker address");
                return VerificationHandle::ready(
                    task_id,
                    VerificationResult::rejected(VerificationError::Type(format!(
                        "invalid worker address: {}",
                        e
                    ))),
                );
            }
        };

        let Some(receiver) = self
            .creations
            .register(task_id, CreationRequest { task, worker })
            .await
        else {
            return VerificationHandle::ready(
                task_id,
                VerificationResult::rejected(VerificationError::TaskValidity(
                    ALREADY_PENDING.to_string(),
                )),
            );
        };

        let verifier = self.clone();
        tokio::spawn(async move { verifier.poll_task_creation(task_id).await });

        VerificationHandle::waiting(task_id, receiver)
    }

    /// Whether `worker_address` is the worker elected for `task` in the
    /// epoch containing `block_number`
    pub async fn verify_selected_worker(
        &self,
        task: &Task,
        block_number: u64,
        worker_address: &Address,
    ) -> VerificationResult {
        let Some(epoch) = self.window.find_for_block(block_number).await else {
            debug!(task_id = %task.task_id, block_number, "No cached epoch covers block");
            return VerificationResult::rejected(VerificationError::TaskValidity(
                EPOCH_PARAMS_MISSING.to_string(),
            ));
        };

        let group = match select_group(&task.contract_address, &epoch, self.config.group_size) {
            Ok(group) => group,
            Err(e) => {
                return VerificationResult::rejected(VerificationError::TaskValidity(format!(
                    "worker selection failed: {}",
                    e
                )))
            }
        };

        if group.contains(worker_address) {
            VerificationResult::verified()
        } else {
            VerificationResult::rejected(VerificationError::WorkerSelection {
                selected: group[0],
                claimed: *worker_address,
            })
        }
    }

    /// Check `result` against the commitments the ledger recorded for it
    pub async fn verify_task_submission(
        &self,
        result: TaskResult,
        contract: ContractAddress,
    ) -> VerificationHandle {
        let task_id = result.task_id;

        let Some(receiver) = self
            .submissions
            .register(task_id, SubmissionRequest { result, contract })
            .await
        else {
            return VerificationHandle::ready(
                task_id,
                VerificationResult::rejected(VerificationError::TaskValidity(
                    ALREADY_PENDING.to_string(),
                )),
            );
        };

        let verifier = self.clone();
        tokio::spawn(async move { verifier.poll_task_submission(task_id).await });

        VerificationHandle::waiting(task_id, receiver)
    }

    pub async fn delete_task_creation_listener(&self, task_id: &TaskId) -> bool {
        self.creations.cancel(task_id).await
    }

    pub async fn delete_task_submission_listener(&self, task_id: &TaskId) -> bool {
        self.submissions.cancel(task_id).await
    }

    /// Route one ledger event. Returns how many pending callers it resolved.
    pub async fn handle_event(&self, event: LedgerEvent) -> usize {
        match event {
            LedgerEvent::WorkersParameterized(epoch) => {
                self.window.push(epoch).await;
                0
            }
            LedgerEvent::TaskRecordCreated(record) => {
                usize::from(self.on_record_created(&record).await)
            }
            LedgerEvent::TaskRecordsCreated(records) => {
                let mut resolved = 0;
                for record in &records {
                    resolved += usize::from(self.on_record_created(record).await);
                }
                resolved
            }
            LedgerEvent::ReceiptVerified(receipt) => {
                usize::from(self.on_receipt_verified(&receipt).await)
            }
            LedgerEvent::ReceiptsVerified(receipts) => {
                let mut resolved = 0;
                for receipt in &receipts {
                    resolved += usize::from(self.on_receipt_verified(receipt).await);
                }
                resolved
            }
            LedgerEvent::ReceiptFailed { task_id } => {
                usize::from(self.on_receipt_failed(&task_id).await)
            }
            LedgerEvent::SecretContractDeployed {
                contract_address,
                code_hash,
                initial_delta_hash,
            } => usize::from(
                self.on_contract_deployed(&contract_address, code_hash, initial_delta_hash)
                    .await,
            ),
        }
    }

    async fn poll_task_creation(&self, task_id: TaskId) {
        let record = match self.reader.get_task_params(&task_id).await {
            Ok(record) => record,
            Err(e) => {
                if let Some(pending) = self.creations.take(&task_id).await {
                    let outcome =
                        VerificationResult::rejected(VerificationError::Ledger(e.to_string()));
                    self.finish_creation(pending, outcome, "poll");
                }
                return;
            }
        };

        match record.status {
            LedgerTaskStatus::RecordUndefined => {
                debug!(task_id = %task_id, "Task not on ledger yet, waiting for creation event");
            }
            LedgerTaskStatus::RecordCreated => {
                if let Some(pending) = self.creations.take(&task_id).await {
                    let outcome = self
                        .check_creation(
                            &pending.context,
                            &record.inputs_hash,
                            record.gas_limit,
                            record.block_number,
                        )
                        .await;
                    self.finish_creation(pending, outcome, "poll");
                }
            }
            other => {
                if let Some(pending) = self.creations.take(&task_id).await {
                    let outcome = VerificationResult::rejected(VerificationError::TaskValidity(
                        format!("unexpected status {}", other),
                    ));
                    self.finish_creation(pending, outcome, "poll");
                }
            }
        }
    }

    async fn on_record_created(&self, record: &CreatedRecord) -> bool {
        let Some(pending) = self.creations.take(&record.task_id).await else {
            return false;
        };

        let outcome = self
            .check_creation(
                &pending.context,
                &record.inputs_hash,
                record.gas_limit,
                Some(record.block_number),
            )
            .await;
        self.finish_creation(pending, outcome, "event");
        true
    }

    async fn check_creation(
        &self,
        request: &CreationRequest,
        inputs_hash: &Hash,
        gas_limit: u64,
        block_number: Option<u64>,
    ) -> VerificationResult {
        if self.config.verify_inputs_hash {
            let computed = request.task.inputs_hash();
            if &computed != inputs_hash {
                return VerificationResult::rejected(VerificationError::hash_mismatch(
                    "inputsHash",
                    inputs_hash,
                    &computed,
                ));
            }
        }

        let Some(block_number) = block_number else {
            return VerificationResult::rejected(VerificationError::TaskValidity(
                EPOCH_PARAMS_MISSING.to_string(),
            ));
        };

        let outcome = self
            .verify_selected_worker(&request.task, block_number, &request.worker)
            .await;
        if outcome.is_verified {
            outcome.with_gas_limit(gas_limit)
        } else {
            outcome
        }
    }

    fn finish_creation(
        &self,
        pending: PendingVerification<CreationRequest>,
        outcome: VerificationResult,
        path: &'static str,
    ) {
        let task_id = pending.context.task.task_id;
        let waited_ms = pending.waited().as_millis() as u64;

        match &outcome.error {
            None => info!(
                task_id = %task_id,
                kind = pending.context.task.kind_name(),
                path,
                waited_ms,
                "✅ Task creation verified"
            ),
            Some(error) => warn!(
                task_id = %task_id,
                path,
                waited_ms,
                error = %error,
                "❌ Task creation rejected"
            ),
        }

        if !pending.resolve(outcome) {
            debug!(task_id = %task_id, "Creation caller went away before resolution");
        }
    }

    async fn poll_task_submission(&self, task_id: TaskId) {
        let record = match self.reader.get_task_params(&task_id).await {
            Ok(record) => record,
            Err(e) => {
                if let Some(pending) = self.submissions.take(&task_id).await {
                    let outcome =
                        VerificationResult::rejected(VerificationError::Ledger(e.to_string()));
                    self.finish_submission(pending, outcome, "poll");
                }
                return;
            }
        };

        match record.status {
            LedgerTaskStatus::ReceiptVerified => {
                let Some(pending) = self.submissions.take(&task_id).await else {
                    return;
                };
                let outcome = if pending.context.result.is_failed() {
                    VerificationResult::rejected(VerificationError::TaskValidity(
                        TASK_DID_NOT_FAIL.to_string(),
                    ))
                } else {
                    match self.reader.get_contract_params(&pending.context.contract).await {
                        Ok(params) => check_against_contract(&pending.context.result, &params),
                        Err(e) => {
                            VerificationResult::rejected(VerificationError::Ledger(e.to_string()))
                        }
                    }
                };
                self.finish_submission(pending, outcome, "poll");
            }
            status if status.is_failure_receipt() => {
                if let Some(pending) = self.submissions.take(&task_id).await {
                    let outcome = check_failure_claim(&pending.context.result);
                    self.finish_submission(pending, outcome, "poll");
                }
            }
            status => {
                debug!(task_id = %task_id, %status, "No receipt yet, waiting for receipt event");
            }
        }
    }

    async fn on_receipt_verified(&self, receipt: &VerifiedReceipt) -> bool {
        let Some(pending) = self.submissions.take(&receipt.task_id).await else {
            return false;
        };

        let result = &pending.context.result;
        let outcome = match &result.kind {
            ResultKind::Failed => VerificationResult::rejected(VerificationError::TaskValidity(
                TASK_DID_NOT_FAIL.to_string(),
            )),
            ResultKind::Deploy { .. } => {
                VerificationResult::rejected(VerificationError::TaskValidity(format!(
                    "deploy result cannot be confirmed by {}",
                    LedgerEventKind::ReceiptVerified.name()
                )))
            }
            ResultKind::Compute(_) => compare_commitments(
                result,
                "outputHash",
                Some(receipt.output_hash),
                Some(receipt.delta_hash),
            ),
        };

        self.finish_submission(pending, outcome, "event");
        true
    }

    async fn on_contract_deployed(
        &self,
        contract_address: &ContractAddress,
        code_hash: Hash,
        initial_delta_hash: Hash,
    ) -> bool {
        let task_id = TaskId::from(*contract_address);
        let Some(pending) = self.submissions.take(&task_id).await else {
            return false;
        };

        let result = &pending.context.result;
        let outcome = match &result.kind {
            ResultKind::Failed => VerificationResult::rejected(VerificationError::TaskValidity(
                TASK_DID_NOT_FAIL.to_string(),
            )),
            ResultKind::Compute(_) => {
                VerificationResult::rejected(VerificationError::TaskValidity(format!(
                    "compute result cannot be confirmed by {}",
                    LedgerEventKind::SecretContractDeployed.name()
                )))
            }
            ResultKind::Deploy { .. } => compare_commitments(
                result,
                "codeHash",
                Some(code_hash),
                Some(initial_delta_hash),
            ),
        };

        self.finish_submission(pending, outcome, "event");
        true
    }

    async fn on_receipt_failed(&self, task_id: &TaskId) -> bool {
        let Some(pending) = self.submissions.take(task_id).await else {
            return false;
        };

        let outcome = check_failure_claim(&pending.context.result);
        self.finish_submission(pending, outcome, "event");
        true
    }

    fn finish_submission(
        &self,
        pending: PendingVerification<SubmissionRequest>,
        outcome: VerificationResult,
        path: &'static str,
    ) {
        let task_id = pending.context.result.task_id;
        let waited_ms = pending.waited().as_millis() as u64;

        match &outcome.error {
            None => info!(
                task_id = %task_id,
                kind = pending.context.result.kind_name(),
                path,
                waited_ms,
                "✅ Task submission verified"
            ),
            Some(error) => warn!(
                task_id = %task_id,
                path,
                waited_ms,
                error = %error,
                "❌ Task submission rejected"
            ),
        }

        if !pending.resolve(outcome) {
            debug!(task_id = %task_id, "Submission caller went away before resolution");
        }
    }
}

/// A failure claim is only true when the ledger recorded a failed receipt
fn check_failure_claim(result: &TaskResult) -> VerificationResult {
    if result.is_failed() {
        VerificationResult::verified()
    } else {
        VerificationResult::rejected(VerificationError::TaskFailed(format!(
            "ledger recorded failure for task {}",
            result.task_id
        )))
    }
}

/// Compare against the contract's recorded hashes. A deployment commits to
/// its code hash and delta 0; a compute producing state version `k` commits
/// to output `k - 1` and delta `k`.
fn check_against_contract(result: &TaskResult, params: &ContractParams) -> VerificationResult {
    match &result.kind {
        ResultKind::Deploy { .. } => compare_commitments(
            result,
            "codeHash",
            Some(params.code_hash),
            params.delta_hashes.first().copied(),
        ),
        ResultKind::Compute(commitment) => {
            let key = commitment.delta.key;
            let output = key
                .checked_sub(1)
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| params.output_hashes.get(i))
                .copied();
            let delta = usize::try_from(key)
                .ok()
                .and_then(|i| params.delta_hashes.get(i))
                .copied();
            compare_commitments(result, "outputHash", output, delta)
        }
        ResultKind::Failed => VerificationResult::rejected(VerificationError::TaskValidity(
            TASK_DID_NOT_FAIL.to_string(),
        )),
    }
}

fn compare_commitments(
    result: &TaskResult,
    output_field: &str,
    expected_output: Option<Hash>,
    expected_delta: Option<Hash>,
) -> VerificationResult {
    let Some(delta) = result.delta() else {
        return VerificationResult::rejected(VerificationError::TaskValidity(
            "result carries no delta".to_string(),
        ));
    };

    let actual_output = keccak256(&result.output);
    match expected_output {
        None => {
            return VerificationResult::rejected(VerificationError::missing_commitment(
                output_field,
                &actual_output,
            ))
        }
        Some(expected) if expected != actual_output => {
            return VerificationResult::rejected(VerificationError::hash_mismatch(
                output_field,
                &expected,
                &actual_output,
            ))
        }
        Some(_) => {}
    }

    let actual_delta = keccak256(&delta.data);
    match expected_delta {
        None => VerificationResult::rejected(VerificationError::missing_commitment(
            "deltaHash",
            &actual_delta,
        )),
        Some(expected) if expected != actual_delta => VerificationResult::rejected(
            VerificationError::hash_mismatch("deltaHash", &expected, &actual_delta),
        ),
        Some(_) => VerificationResult::verified(),
    }
}
