//! Ledger-compatible hashing.
//!
//! Everything here must match the contract's own hashing bit-for-bit, since
//! other peers and the ledger recompute the same values.

use crate::types::{ContractAddress, Hash};
use num_bigint::BigUint;
use sha3::{Digest, Keccak256};

pub fn keccak256(data: &[u8]) -> Hash {
    Keccak256::digest(data).into()
}

/// Big-endian `uint256` word. Values wider than 256 bits keep their low 256 bits.
pub fn encode_uint256(value: &BigUint) -> [u8; 32] {
    let bytes = value.to_bytes_be();
    let mut word = [0u8; 32];
    if bytes.len() >= 32 {
        word.copy_from_slice(&bytes[bytes.len() - 32..]);
    } else {
        word[32 - bytes.len()..].copy_from_slice(&bytes);
    }
    word
}

/// `keccak256(abi.encode(uint256 seed, bytes32 contract, uint256 nonce))`
pub fn selection_hash(seed: &BigUint, contract: &ContractAddress, nonce: u64) -> Hash {
    let mut input = [0u8; 96];
    input[..32].copy_from_slice(&encode_uint256(seed));
    input[32..64].copy_from_slice(contract.as_bytes());
    input[88..].copy_from_slice(&nonce.to_be_bytes());
    keccak256(&input)
}

/// Hash of a list of byte strings, each prefixed with its 8-byte big-endian
/// length so field boundaries are unambiguous
pub fn inputs_hash(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}
