use crate::error::{IdentifierError, VerificationError};
use crate::hashing;
use crate::worker_selection::SelectionError;
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub type Hash = [u8; 32];

/// Hex (de)serialization for byte fields, `0x` prefix optional on input
pub mod serde_hex {
    use hex::FromHex;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Display;

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: FromHex,
        T::Error: Display,
    {
        let s = String::deserialize(deserializer)?;
        let stripped = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(&s);
        T::from_hex(stripped).map_err(serde::de::Error::custom)
    }
}

macro_rules! fixed_hex_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// First four bytes in hex, for log lines
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = IdentifierError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let stripped = s
                    .strip_prefix("0x")
                    .or_else(|| s.strip_prefix("0X"))
                    .unwrap_or(s);
                if stripped.len() != $len * 2 {
                    return Err(IdentifierError::InvalidLength {
                        kind: stringify!($name),
                        expected: $len * 2,
                        actual: stripped.len(),
                    });
                }
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(stripped, &mut bytes).map_err(|e| {
                    IdentifierError::InvalidHex {
                        kind: stringify!($name),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_hex_id!(
    /// Content identifier of a task (32 bytes)
    TaskId,
    32
);

fixed_hex_id!(
    /// Chain account address of a worker (20 bytes)
    Address,
    20
);

fixed_hex_id!(
    /// Secret contract address (32 bytes)
    ContractAddress,
    32
);

impl From<ContractAddress> for TaskId {
    fn from(address: ContractAddress) -> Self {
        TaskId(address.0)
    }
}

impl From<TaskId> for ContractAddress {
    fn from(task_id: TaskId) -> Self {
        ContractAddress(task_id.0)
    }
}

/// Lifecycle status of a task on this worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Unverified, // Admitted to the pool, not yet checked against the ledger
    InProgress, // Verified and persisted, executing
    Success,    // Result attached, execution succeeded
    Failed,     // Result attached, execution failed
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Only single-step forward moves are allowed
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Unverified, InProgress) | (InProgress, Success) | (InProgress, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "UNVERIFIED",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task-type discriminator and the payload only that type carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Compute,
    Deploy {
        #[serde(with = "serde_hex")]
        pre_code: Vec<u8>,
    },
}

/// A unit of confidential computation requested from the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub kind: TaskKind,
    #[serde(with = "serde_hex")]
    pub encrypted_fn: Vec<u8>,
    #[serde(with = "serde_hex")]
    pub encrypted_args: Vec<u8>,
    #[serde(with = "serde_hex")]
    pub user_dh_key: Vec<u8>,
    pub gas_limit: u64,
    pub contract_address: ContractAddress,
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn compute(
        task_id: TaskId,
        contract_address: ContractAddress,
        encrypted_fn: Vec<u8>,
        encrypted_args: Vec<u8>,
        user_dh_key: Vec<u8>,
        gas_limit: u64,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Unverified,
            kind: TaskKind::Compute,
            encrypted_fn,
            encrypted_args,
            user_dh_key,
            gas_limit,
            contract_address,
            result: None,
        }
    }

    /// A deploy task's id is the address of the contract it creates
    pub fn deploy(
        task_id: TaskId,
        pre_code: Vec<u8>,
        encrypted_fn: Vec<u8>,
        encrypted_args: Vec<u8>,
        user_dh_key: Vec<u8>,
        gas_limit: u64,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Unverified,
            kind: TaskKind::Deploy { pre_code },
            encrypted_fn,
            encrypted_args,
            user_dh_key,
            gas_limit,
            contract_address: ContractAddress::from(task_id),
            result: None,
        }
    }

    /// Parse a raw task payload; an unknown or malformed type is a type error
    pub fn from_json(raw: &str) -> Result<Self, VerificationError> {
        serde_json::from_str(raw).map_err(|e| VerificationError::Type(e.to_string()))
    }

    pub fn is_deploy(&self) -> bool {
        matches!(self.kind, TaskKind::Deploy { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TaskKind::Compute => "compute",
            TaskKind::Deploy { .. } => "deploy",
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Content hash committed on the ledger when the task record is created
    pub fn inputs_hash(&self) -> Hash {
        let target = match &self.kind {
            TaskKind::Compute => self.contract_address.as_bytes().to_vec(),
            TaskKind::Deploy { pre_code } => hashing::keccak256(pre_code).to_vec(),
        };
        hashing::inputs_hash(&[
            &self.encrypted_fn,
            &self.encrypted_args,
            &target,
            &self.user_dh_key,
        ])
    }
}

/// Versioned state mutation produced by a successful execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub key: u64,
    #[serde(with = "serde_hex")]
    pub data: Vec<u8>,
}

/// What a successful execution commits to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCommitment {
    pub delta: Delta,
    #[serde(with = "serde_hex")]
    pub ethereum_payload: Vec<u8>,
    pub ethereum_address: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Compute(ExecutionCommitment),
    Deploy {
        commitment: ExecutionCommitment,
        #[serde(with = "serde_hex")]
        pre_code_hash: Hash,
    },
    Failed,
}

/// Output of executing a task. A failed result never carries a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    #[serde(with = "serde_hex")]
    pub output: Vec<u8>,
    pub used_gas: u64,
    #[serde(with = "serde_hex")]
    pub signature: Vec<u8>,
    pub kind: ResultKind,
}

impl TaskResult {
    pub fn compute(task_id: TaskId, output: Vec<u8>, used_gas: u64, delta: Delta) -> Self {
        Self {
            task_id,
            output,
            used_gas,
            signature: Vec::new(),
            kind: ResultKind::Compute(ExecutionCommitment {
                delta,
                ethereum_payload: Vec::new(),
                ethereum_address: None,
            }),
        }
    }

    pub fn deploy(
        task_id: TaskId,
        output: Vec<u8>,
        used_gas: u64,
        delta: Delta,
        pre_code_hash: Hash,
    ) -> Self {
        Self {
            task_id,
            output,
            used_gas,
            signature: Vec::new(),
            kind: ResultKind::Deploy {
                commitment: ExecutionCommitment {
                    delta,
                    ethereum_payload: Vec::new(),
                    ethereum_address: None,
                },
                pre_code_hash,
            },
        }
    }

    pub fn failed(task_id: TaskId, output: Vec<u8>, used_gas: u64) -> Self {
        Self {
            task_id,
            output,
            used_gas,
            signature: Vec::new(),
            kind: ResultKind::Failed,
        }
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    /// Parse a raw result payload from the execution collaborator
    pub fn from_json(raw: &str) -> Result<Self, VerificationError> {
        serde_json::from_str(raw).map_err(|e| VerificationError::Type(e.to_string()))
    }

    pub fn status(&self) -> TaskStatus {
        match self.kind {
            ResultKind::Failed => TaskStatus::Failed,
            _ => TaskStatus::Success,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.kind, ResultKind::Failed)
    }

    pub fn is_deploy(&self) -> bool {
        matches!(self.kind, ResultKind::Deploy { .. })
    }

    pub fn delta(&self) -> Option<&Delta> {
        match &self.kind {
            ResultKind::Compute(commitment) => Some(&commitment.delta),
            ResultKind::Deploy { commitment, .. } => Some(&commitment.delta),
            ResultKind::Failed => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ResultKind::Compute(_) => "compute",
            ResultKind::Deploy { .. } => "deploy",
            ResultKind::Failed => "failed",
        }
    }
}

/// Frozen worker/stake set of one epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochSnapshot {
    pub seed: BigUint,
    pub first_block_number: u64,
    pub workers: Vec<Address>,
    pub balances: Vec<BigUint>,
    pub nonce: u64,
}

impl EpochSnapshot {
    pub fn new(
        seed: BigUint,
        first_block_number: u64,
        workers: Vec<Address>,
        balances: Vec<BigUint>,
        nonce: u64,
    ) -> Result<Self, SelectionError> {
        if workers.len() != balances.len() {
            return Err(SelectionError::WorkerBalanceMismatch {
                workers: workers.len(),
                balances: balances.len(),
            });
        }
        if seed.bits() > 256 {
            return Err(SelectionError::SeedTooLarge { bits: seed.bits() });
        }

        Ok(Self {
            seed,
            first_block_number,
            workers,
            balances,
            nonce,
        })
    }

    pub fn total_stake(&self) -> BigUint {
        self.balances.iter().sum()
    }

    /// Workers that can win a selection draw
    pub fn staked_worker_count(&self) -> usize {
        self.balances.iter().filter(|b| !b.is_zero()).count()
    }
}

/// Uniform outcome of every verification operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub is_verified: bool,
    pub error: Option<VerificationError>,
    pub gas_limit: Option<u64>,
}

impl VerificationResult {
    pub fn verified() -> Self {
        Self {
            is_verified: true,
            error: None,
            gas_limit: None,
        }
    }

    pub fn verified_with_gas(gas_limit: u64) -> Self {
        Self {
            is_verified: true,
            error: None,
            gas_limit: Some(gas_limit),
        }
    }

    pub fn rejected(error: VerificationError) -> Self {
        Self {
            is_verified: false,
            error: Some(error),
            gas_limit: None,
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }
}
