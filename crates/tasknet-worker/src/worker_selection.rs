//! Stake-weighted deterministic worker selection.
//!
//! Any party holding the same [`EpochSnapshot`] computes the same group:
//!
//! ```text
//! total = Σ balances
//! for nonce = 0, 1, 2, ...
//!     r = uint256(keccak256(seed ‖ contract ‖ nonce)) mod total
//!     walk workers in index order, r -= balance, first worker with r <= 0 wins
//!     append the winner unless already selected
//! until the group is full
//! ```

use crate::hashing::selection_hash;
use crate::types::{Address, ContractAddress, EpochSnapshot};
use num_bigint::BigUint;
use num_traits::Zero;
use thiserror::Error;

/// Upper bound on draws before giving up on a degenerate stake distribution
pub const MAX_SELECTION_ROUNDS: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("Epoch has no workers")]
    EmptyEpoch,

    #[error("Epoch total stake is zero")]
    ZeroStake,

    #[error("Invalid group size: requested {requested}, staked workers {available}")]
    InvalidGroupSize { requested: usize, available: usize },

    #[error("Selection exhausted after {rounds} rounds")]
    Exhausted { rounds: u64 },

    #[error("Workers/balances length mismatch: {workers} workers, {balances} balances")]
    WorkerBalanceMismatch { workers: usize, balances: usize },

    #[error("Seed exceeds 256 bits ({bits} bits)")]
    SeedTooLarge { bits: u64 },
}

/// Select `group_size` distinct workers for `contract`, in selection order
pub fn select_group(
    contract: &ContractAddress,
    epoch: &EpochSnapshot,
    group_size: usize,
) -> Result<Vec<Address>, SelectionError> {
    if epoch.workers.is_empty() {
        return Err(SelectionError::EmptyEpoch);
    }
    if epoch.workers.len() != epoch.balances.len() {
        return Err(SelectionError::WorkerBalanceMismatch {
            workers: epoch.workers.len(),
            balances: epoch.balances.len(),
        });
    }

    let total = epoch.total_stake();
    if total.is_zero() {
        return Err(SelectionError::ZeroStake);
    }

    let available = epoch.staked_worker_count();
    if group_size == 0 || group_size > available {
        return Err(SelectionError::InvalidGroupSize {
            requested: group_size,
            available,
        });
    }

    let mut selected: Vec<Address> = Vec::with_capacity(group_size);
    let mut nonce = 0u64;

    while selected.len() < group_size {
        if nonce >= MAX_SELECTION_ROUNDS {
            return Err(SelectionError::Exhausted { rounds: nonce });
        }

        let candidate = draw(contract, epoch, &total, nonce);
        if !selected.contains(&candidate) {
            selected.push(candidate);
        }
        nonce += 1;
    }

    Ok(selected)
}

/// The single worker elected for `contract` in this epoch
pub fn select_worker(
    contract: &ContractAddress,
    epoch: &EpochSnapshot,
) -> Result<Address, SelectionError> {
    let group = select_group(contract, epoch, 1)?;
    Ok(group[0])
}

fn draw(contract: &ContractAddress, epoch: &EpochSnapshot, total: &BigUint, nonce: u64) -> Address {
    let hash = selection_hash(&epoch.seed, contract, nonce);
    let mut remaining = BigUint::from_bytes_be(&hash) % total;

    for (worker, balance) in epoch.workers.iter().zip(&epoch.balances) {
        // `remaining - balance <= 0` without leaving unsigned arithmetic
        if remaining <= *balance {
            return *worker;
        }
        remaining -= balance;
    }

    // Unreachable while remaining < total; the ledger falls back to the last worker
    epoch.workers[epoch.workers.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(i: u8) -> Address {
        Address::from_bytes([i + 1; 20])
    }

    fn reference_epoch() -> EpochSnapshot {
        EpochSnapshot::new(
            BigUint::from(10u8),
            0,
            (0..5).map(worker).collect(),
            (1u32..=5).map(BigUint::from).collect(),
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_reference_vector_single() {
        let contract = ContractAddress::from_bytes([0x11; 32]);
        let epoch = reference_epoch();

        // Walk the algorithm by hand with the same hash
        let hash = selection_hash(&epoch.seed, &contract, 0);
        let r = BigUint::from_bytes_be(&hash) % BigUint::from(15u8);
        assert_eq!(r, BigUint::from(11u8));
        // 11 -1=10 -2=8 -3=5 -4=1 -5=-4 -> fifth worker
        let mut remaining: i64 = 11;
        let mut manual = None;
        for (i, b) in [1i64, 2, 3, 4, 5].iter().enumerate() {
            remaining -= b;
            if remaining <= 0 {
                manual = Some(worker(i as u8));
                break;
            }
        }

        let selected = select_group(&contract, &epoch, 1).unwrap();
        assert_eq!(selected, vec![manual.unwrap()]);
        assert_eq!(selected, vec![worker(4)]);
        assert_eq!(select_worker(&contract, &epoch).unwrap(), worker(4));
    }

    #[test]
    fn test_reference_vector_group() {
        let contract = ContractAddress::from_bytes([0x11; 32]);
        let epoch = reference_epoch();

        assert_eq!(
            select_group(&contract, &epoch, 3).unwrap(),
            vec![worker(4), worker(3), worker(2)]
        );
        assert_eq!(
            select_group(&contract, &epoch, 5).unwrap(),
            vec![worker(4), worker(3), worker(2), worker(1), worker(0)]
        );
    }

    #[test]
    fn test_large_stakes_and_seed() {
        let seed = BigUint::parse_bytes("8f".repeat(32).as_bytes(), 16).unwrap();
        let workers: Vec<Address> = (0..3).map(|i| Address::from_bytes([0xa0 + i; 20])).collect();
        let wei = BigUint::from(10u64).pow(20);
        let balances = vec![&wei * 10u32, &wei * 5u32, &wei * 30u32];
        let epoch = EpochSnapshot::new(seed, 100, workers.clone(), balances, 1).unwrap();
        let contract = ContractAddress::from_bytes([0xc2; 32]);

        assert_eq!(
            select_group(&contract, &epoch, 2).unwrap(),
            vec![workers[2], workers[0]]
        );
    }

    #[test]
    fn test_selection_errors() {
        let contract = ContractAddress::from_bytes([1; 32]);

        let empty = EpochSnapshot::new(BigUint::from(1u8), 0, vec![], vec![], 0).unwrap();
        assert_eq!(
            select_group(&contract, &empty, 1),
            Err(SelectionError::EmptyEpoch)
        );

        let unstaked = EpochSnapshot::new(
            BigUint::from(1u8),
            0,
            vec![worker(0), worker(1)],
            vec![BigUint::zero(), BigUint::zero()],
            0,
        )
        .unwrap();
        assert_eq!(
            select_group(&contract, &unstaked, 1),
            Err(SelectionError::ZeroStake)
        );

        let epoch = reference_epoch();
        assert!(matches!(
            select_group(&contract, &epoch, 0),
            Err(SelectionError::InvalidGroupSize { .. })
        ));
        assert!(matches!(
            select_group(&contract, &epoch, 6),
            Err(SelectionError::InvalidGroupSize { .. })
        ));
    }

    #[test]
    fn test_zero_stake_worker_never_selected_past_index_zero() {
        let contract = ContractAddress::from_bytes([9; 32]);
        let epoch = EpochSnapshot::new(
            BigUint::from(77u8),
            0,
            vec![worker(0), worker(1), worker(2)],
            vec![BigUint::from(3u8), BigUint::zero(), BigUint::from(3u8)],
            0,
        )
        .unwrap();

        let group = select_group(&contract, &epoch, 2).unwrap();
        assert!(!group.contains(&worker(1)));
    }
}
