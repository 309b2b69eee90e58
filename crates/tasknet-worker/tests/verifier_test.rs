use num_bigint::BigUint;
use std::sync::Arc;
use std::time::Duration;
use tasknet_worker::hashing::keccak256;
use tasknet_worker::*;
use tokio::time::{sleep, timeout};

const EPOCH_SIZE: u64 = 100;

fn contract() -> ContractAddress {
    ContractAddress::from_bytes([0x11; 32])
}

fn worker(i: u8) -> Address {
    Address::from_bytes([i + 1; 20])
}

/// The worker elected for `contract()` in every `epoch(..)`
fn elected() -> Address {
    worker(4)
}

fn epoch(first_block_number: u64) -> EpochSnapshot {
    EpochSnapshot::new(
        BigUint::from(10u8),
        first_block_number,
        (0..5).map(worker).collect(),
        (1u32..=5).map(BigUint::from).collect(),
        0,
    )
    .unwrap()
}

fn compute_task(byte: u8) -> Task {
    Task::compute(
        TaskId::from_bytes([byte; 32]),
        contract(),
        b"encrypted-fn".to_vec(),
        b"encrypted-args".to_vec(),
        b"user-key".to_vec(),
        1_000,
    )
}

fn deploy_task() -> Task {
    // Deploys to its own id, which is `contract()`
    Task::deploy(
        TaskId::from(contract()),
        b"pre-code".to_vec(),
        b"ctor".to_vec(),
        b"ctor-args".to_vec(),
        b"user-key".to_vec(),
        5_000,
    )
}

fn compute_result(task_id: TaskId, key: u64) -> TaskResult {
    TaskResult::compute(
        task_id,
        b"output".to_vec(),
        300,
        Delta {
            key,
            data: b"state".to_vec(),
        },
    )
}

fn deploy_result(task_id: TaskId) -> TaskResult {
    TaskResult::deploy(
        task_id,
        b"bytecode".to_vec(),
        900,
        Delta {
            key: 0,
            data: b"initial-state".to_vec(),
        },
        keccak256(b"pre-code"),
    )
}

/// Verifier without a dispatcher so tests route events themselves
async fn setup() -> (Arc<MemoryLedger>, TaskVerifier) {
    let ledger = Arc::new(MemoryLedger::new(EPOCH_SIZE));
    let window = Arc::new(EpochParameterWindow::new(5));
    window
        .bootstrap(vec![epoch(100), epoch(200)], EPOCH_SIZE)
        .await;
    let verifier = TaskVerifier::new(ledger.clone(), window, VerifierConfig::default());
    (ledger, verifier)
}

async fn wait_for_reads(ledger: &MemoryLedger, reads: u64) {
    timeout(Duration::from_secs(5), async {
        while ledger.task_reads() < reads {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("ledger poll never ran");
    // Let the poll finish inspecting the record
    sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_start_bootstraps_window_from_ledger() {
    let ledger = Arc::new(MemoryLedger::new(EPOCH_SIZE));
    ledger
        .set_epochs(vec![epoch(300), epoch(400), epoch(0), epoch(100), epoch(200)])
        .await;

    let verifier = TaskVerifier::start(
        ledger.clone(),
        ledger.clone(),
        5,
        VerifierConfig::default(),
    )
    .await
    .unwrap();

    let blocks: Vec<u64> = verifier
        .window()
        .snapshots()
        .await
        .iter()
        .map(|e| e.first_block_number)
        .collect();
    assert_eq!(blocks, vec![0, 100, 200, 300, 400]);

    // A published epoch reaches the window through the subscription
    ledger.publish_epoch(epoch(500)).await;
    timeout(Duration::from_secs(5), async {
        while verifier.window().latest().await.map(|e| e.first_block_number) != Some(500) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(verifier.window().find_for_block(50).await.is_none());
}

#[tokio::test]
async fn test_creation_resolved_by_event_when_not_yet_on_ledger() {
    let ledger = Arc::new(MemoryLedger::new(EPOCH_SIZE));
    ledger.set_epochs(vec![epoch(100)]).await;
    let verifier = TaskVerifier::start(
        ledger.clone(),
        ledger.clone(),
        5,
        VerifierConfig::default(),
    )
    .await
    .unwrap();

    let task = compute_task(1);
    let handle = verifier
        .verify_task_creation(task.clone(), &elected().to_string())
        .await;
    wait_for_reads(&ledger, 1).await;
    assert_eq!(verifier.pending_creation_count().await, 1);

    ledger
        .set_task_record(task.task_id, TaskRecord::created(task.inputs_hash(), 1_000, 150))
        .await;
    ledger
        .emit(LedgerEvent::TaskRecordCreated(CreatedRecord {
            task_id: task.task_id,
            inputs_hash: task.inputs_hash(),
            gas_limit: 1_000,
            block_number: 150,
        }))
        .await;

    let result = timeout(Duration::from_secs(5), handle).await.unwrap();
    assert!(result.is_verified);
    assert_eq!(result.gas_limit, Some(1_000));
    assert_eq!(verifier.pending_creation_count().await, 0);
}

#[tokio::test]
async fn test_event_after_poll_resolution_is_noop() {
    let (ledger, verifier) = setup().await;
    let task = compute_task(2);
    ledger
        .set_task_record(task.task_id, TaskRecord::created(task.inputs_hash(), 1_000, 150))
        .await;

    let result = verifier
        .verify_task_creation(task.clone(), &elected().to_string())
        .await
        .await;
    assert!(result.is_verified);

    let late = LedgerEvent::TaskRecordCreated(CreatedRecord {
        task_id: task.task_id,
        inputs_hash: task.inputs_hash(),
        gas_limit: 1_000,
        block_number: 150,
    });
    assert_eq!(verifier.handle_event(late).await, 0);
}

#[tokio::test]
async fn test_concurrent_events_resolve_exactly_once() {
    let (ledger, verifier) = setup().await;
    let task = compute_task(3);
    let handle = verifier
        .verify_task_creation(task.clone(), &elected().to_string())
        .await;
    wait_for_reads(&ledger, 1).await;

    let event = LedgerEvent::TaskRecordCreated(CreatedRecord {
        task_id: task.task_id,
        inputs_hash: task.inputs_hash(),
        gas_limit: 1_000,
        block_number: 250,
    });
    let mut joins = Vec::new();
    for _ in 0..8 {
        let verifier = verifier.clone();
        let event = event.clone();
        joins.push(tokio::spawn(async move { verifier.handle_event(event).await }));
    }

    let mut resolved = 0;
    for join in joins {
        resolved += join.await.unwrap();
    }
    assert_eq!(resolved, 1);
    assert!(handle.await.is_verified);
}

#[tokio::test]
async fn test_batch_creation_event() {
    let (ledger, verifier) = setup().await;
    let a = compute_task(4);
    let b = compute_task(5);
    let handle_a = verifier
        .verify_task_creation(a.clone(), &elected().to_string())
        .await;
    let handle_b = verifier
        .verify_task_creation(b.clone(), &worker(0).to_string())
        .await;
    wait_for_reads(&ledger, 2).await;

    let records = [&a, &b]
        .iter()
        .map(|t| CreatedRecord {
            task_id: t.task_id,
            inputs_hash: t.inputs_hash(),
            gas_limit: 1_000,
            block_number: 120,
        })
        .collect();
    assert_eq!(
        verifier
            .handle_event(LedgerEvent::TaskRecordsCreated(records))
            .await,
        2
    );

    assert!(handle_a.await.is_verified);
    let rejected = handle_b.await;
    assert_eq!(
        rejected.error.map(|e| e.kind()),
        Some(ErrorKind::WorkerSelectionVerification)
    );
}

#[tokio::test]
async fn test_block_outside_window_is_validity_error() {
    let (_ledger, verifier) = setup().await;
    let task = compute_task(6);
    let handle = verifier
        .verify_task_creation(task.clone(), &elected().to_string())
        .await;

    let event = LedgerEvent::TaskRecordCreated(CreatedRecord {
        task_id: task.task_id,
        inputs_hash: task.inputs_hash(),
        gas_limit: 1_000,
        block_number: 999,
    });
    assert_eq!(verifier.handle_event(event).await, 1);

    let result = handle.await;
    assert_eq!(
        result.error,
        Some(VerificationError::TaskValidity(
            "epoch params missing".to_string()
        ))
    );
}

#[tokio::test]
async fn test_cancelled_listener_drops_late_events() {
    let (ledger, verifier) = setup().await;
    let task = compute_task(7);
    let handle = verifier
        .verify_task_creation(task.clone(), &elected().to_string())
        .await;
    wait_for_reads(&ledger, 1).await;

    assert!(verifier.delete_task_creation_listener(&task.task_id).await);
    let result = handle.await;
    assert_eq!(result.error.map(|e| e.kind()), Some(ErrorKind::Cancelled));

    let late = LedgerEvent::TaskRecordCreated(CreatedRecord {
        task_id: task.task_id,
        inputs_hash: task.inputs_hash(),
        gas_limit: 1_000,
        block_number: 150,
    });
    assert_eq!(verifier.handle_event(late).await, 0);
}

#[tokio::test]
async fn test_duplicate_registration_leaves_first_pending() {
    let (ledger, verifier) = setup().await;
    let task = compute_task(8);
    let first = verifier
        .verify_task_creation(task.clone(), &elected().to_string())
        .await;
    wait_for_reads(&ledger, 1).await;

    let second = verifier
        .verify_task_creation(task.clone(), &elected().to_string())
        .await
        .await;
    assert_eq!(
        second.error,
        Some(VerificationError::TaskValidity(
            "verification already pending".to_string()
        ))
    );
    assert_eq!(verifier.pending_creation_count().await, 1);

    let event = LedgerEvent::TaskRecordCreated(CreatedRecord {
        task_id: task.task_id,
        inputs_hash: task.inputs_hash(),
        gas_limit: 1_000,
        block_number: 150,
    });
    verifier.handle_event(event).await;
    assert!(first.await.is_verified);
}

#[tokio::test]
async fn test_deploy_code_hash_mismatch() {
    let (ledger, verifier) = setup().await;
    let task = deploy_task();
    ledger
        .set_task_status(&task.task_id, LedgerTaskStatus::ReceiptVerified)
        .await;
    ledger
        .set_contract_params(
            contract(),
            ContractParams {
                code_hash: keccak256(b"some-other-bytecode"),
                delta_hashes: vec![keccak256(b"initial-state")],
                output_hashes: vec![],
            },
        )
        .await;

    let result = verifier
        .verify_task_submission(deploy_result(task.task_id), contract())
        .await
        .await;

    assert!(!result.is_verified);
    assert!(matches!(
        result.error,
        Some(VerificationError::TaskVerification { ref field, .. }) if field == "codeHash"
    ));
}

#[tokio::test]
async fn test_deploy_confirmed_by_contract_event() {
    let (ledger, verifier) = setup().await;
    let task = deploy_task();
    let handle = verifier
        .verify_task_submission(deploy_result(task.task_id), contract())
        .await;
    wait_for_reads(&ledger, 1).await;

    let resolved = verifier
        .handle_event(LedgerEvent::SecretContractDeployed {
            contract_address: contract(),
            code_hash: keccak256(b"bytecode"),
            initial_delta_hash: keccak256(b"initial-state"),
        })
        .await;
    assert_eq!(resolved, 1);
    assert!(handle.await.is_verified);
}

#[tokio::test]
async fn test_deploy_result_rejects_compute_receipt_event() {
    let (ledger, verifier) = setup().await;
    let task = deploy_task();
    let handle = verifier
        .verify_task_submission(deploy_result(task.task_id), contract())
        .await;
    wait_for_reads(&ledger, 1).await;

    verifier
        .handle_event(LedgerEvent::ReceiptVerified(VerifiedReceipt {
            task_id: task.task_id,
            output_hash: keccak256(b"bytecode"),
            delta_hash: keccak256(b"initial-state"),
        }))
        .await;

    assert_eq!(
        handle.await.error.map(|e| e.kind()),
        Some(ErrorKind::TaskValidity)
    );
}

#[tokio::test]
async fn test_failed_result_against_verified_receipt() {
    let (ledger, verifier) = setup().await;
    let task_id = TaskId::from_bytes([9; 32]);
    ledger
        .set_task_status(&task_id, LedgerTaskStatus::ReceiptVerified)
        .await;

    let result = verifier
        .verify_task_submission(TaskResult::failed(task_id, b"revert".to_vec(), 10), contract())
        .await
        .await;

    assert!(!result.is_verified);
    assert_eq!(
        result.error,
        Some(VerificationError::TaskValidity("task did not fail".to_string()))
    );
}

#[tokio::test]
async fn test_failure_receipts() {
    let (ledger, verifier) = setup().await;

    // Ledger recorded a failure and the worker agrees
    let failed_id = TaskId::from_bytes([10; 32]);
    ledger
        .set_task_status(&failed_id, LedgerTaskStatus::ReceiptFailedReturn)
        .await;
    let agreed = verifier
        .verify_task_submission(TaskResult::failed(failed_id, vec![], 1), contract())
        .await
        .await;
    assert!(agreed.is_verified);

    // Worker claims success, failure arrives by event
    let claimed_id = TaskId::from_bytes([11; 32]);
    let handle = verifier
        .verify_task_submission(compute_result(claimed_id, 1), contract())
        .await;
    wait_for_reads(&ledger, 2).await;
    verifier
        .handle_event(LedgerEvent::ReceiptFailed {
            task_id: claimed_id,
        })
        .await;
    assert_eq!(
        handle.await.error.map(|e| e.kind()),
        Some(ErrorKind::TaskFailed)
    );
}

#[tokio::test]
async fn test_compute_submission_against_contract_params() {
    let (ledger, verifier) = setup().await;
    let task_id = TaskId::from_bytes([12; 32]);
    ledger
        .set_task_status(&task_id, LedgerTaskStatus::ReceiptVerified)
        .await;
    ledger
        .set_contract_params(
            contract(),
            ContractParams {
                code_hash: [0; 32],
                delta_hashes: vec![[0; 32], [0; 32], [0; 32], keccak256(b"state")],
                output_hashes: vec![[0; 32], [0; 32], keccak256(b"output")],
            },
        )
        .await;

    let verified = verifier
        .verify_task_submission(compute_result(task_id, 3), contract())
        .await
        .await;
    assert!(verified.is_verified);

    // Same hashes filed under a different state version
    let wrong_key = verifier
        .verify_task_submission(compute_result(task_id, 2), contract())
        .await
        .await;
    assert_eq!(
        wrong_key.error.map(|e| e.kind()),
        Some(ErrorKind::TaskVerification)
    );
}

#[tokio::test]
async fn test_creation_and_submission_registries_are_separate() {
    let (ledger, verifier) = setup().await;
    let task = compute_task(13);

    let creation = verifier
        .verify_task_creation(task.clone(), &elected().to_string())
        .await;
    let submission = verifier
        .verify_task_submission(compute_result(task.task_id, 1), contract())
        .await;
    wait_for_reads(&ledger, 2).await;

    assert_eq!(verifier.pending_creation_count().await, 1);
    assert_eq!(verifier.pending_submission_count().await, 1);

    assert!(verifier.delete_task_submission_listener(&task.task_id).await);
    assert_eq!(submission.await.error.map(|e| e.kind()), Some(ErrorKind::Cancelled));
    assert_eq!(verifier.pending_creation_count().await, 1);

    verifier.delete_task_creation_listener(&task.task_id).await;
    assert_eq!(creation.await.error.map(|e| e.kind()), Some(ErrorKind::Cancelled));
}

#[tokio::test]
async fn test_batch_receipts_resolve_each_submission() {
    let (ledger, verifier) = setup().await;
    let good_id = TaskId::from_bytes([14; 32]);
    let bad_id = TaskId::from_bytes([15; 32]);
    let good = verifier
        .verify_task_submission(compute_result(good_id, 1), contract())
        .await;
    let bad = verifier
        .verify_task_submission(compute_result(bad_id, 1), contract())
        .await;
    wait_for_reads(&ledger, 2).await;

    let receipts = vec![
        VerifiedReceipt {
            task_id: good_id,
            output_hash: keccak256(b"output"),
            delta_hash: keccak256(b"state"),
        },
        VerifiedReceipt {
            task_id: bad_id,
            output_hash: keccak256(b"output"),
            delta_hash: keccak256(b"other-state"),
        },
    ];
    assert_eq!(
        verifier
            .handle_event(LedgerEvent::ReceiptsVerified(receipts))
            .await,
        2
    );

    assert!(good.await.is_verified);
    let rejected = bad.await;
    assert!(matches!(
        rejected.error,
        Some(VerificationError::TaskVerification { ref field, .. }) if field == "deltaHash"
    ));
    assert_eq!(verifier.pending_submission_count().await, 0);
}

#[tokio::test]
async fn test_replayed_epoch_event_keeps_window_consistent() {
    let ledger = Arc::new(MemoryLedger::new(EPOCH_SIZE));
    let window = Arc::new(EpochParameterWindow::new(5));
    window
        .bootstrap((0..5).map(|i| epoch(i * 100)).collect(), EPOCH_SIZE)
        .await;
    let verifier = TaskVerifier::new(ledger, window, VerifierConfig::default());

    // Epoch 400 was published during bootstrap and is delivered again
    verifier
        .handle_event(LedgerEvent::WorkersParameterized(epoch(400)))
        .await;
    verifier
        .handle_event(LedgerEvent::WorkersParameterized(epoch(500)))
        .await;

    let blocks: Vec<u64> = verifier
        .window()
        .snapshots()
        .await
        .iter()
        .map(|e| e.first_block_number)
        .collect();
    assert_eq!(blocks, vec![100, 200, 300, 400, 500]);
    assert_eq!(
        verifier
            .window()
            .find_for_block(550)
            .await
            .map(|e| e.first_block_number),
        Some(500)
    );

    let outcome = verifier
        .verify_selected_worker(&compute_task(16), 550, &elected())
        .await;
    assert!(outcome.is_verified);
}
