// Block data model (§3 of the data model).

use super::transaction::Transaction;
use crate::crypto::hash::{hash_canonical_json, hash_sha3_256_concat, hash_to_hex, Hash32, ZERO_HASH};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const GENESIS_PREV_HASH: Hash32 = ZERO_HASH;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash32,
    pub merkle_root: Hash32,
    pub timestamp: u64,
    pub height: u32,
    pub difficulty: f64,
    pub nonce: u64,
}

impl BlockHeader {
    /// Fixed-order JSON-with-sorted-keys encoding hashed to produce the
    /// block hash. Hashes are hex strings in the wire format, so the header
    /// fields that are themselves hashes are hex-encoded before hashing —
    /// this keeps `hash` reproducible whether computed from the in-memory
    /// header or from the wire JSON dict.
    pub fn canonical_value(&self) -> Value {
        json!({
            "version": self.version,
            "prev_hash": hash_to_hex(&self.prev_hash),
            "merkle_root": hash_to_hex(&self.merkle_root),
            "timestamp": self.timestamp,
            "height": self.height,
            "difficulty": self.difficulty,
            "nonce": self.nonce,
        })
    }

    pub fn compute_hash(&self) -> Hash32 {
        hash_canonical_json(&self.canonical_value())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub version: u32,
    pub prev_hash: Hash32,
    pub merkle_root: Hash32,
    pub timestamp: u64,
    pub height: u32,
    pub difficulty: f64,
    pub nonce: u64,
    pub hash: Hash32,
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub extra_data: Map<String, Value>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block has no transactions")]
    Empty,
    #[error("first transaction must be a coinbase (no inputs)")]
    MissingCoinbase,
    #[error("stored hash does not match recomputed header hash")]
    HashMismatch,
    #[error("merkle root does not match transaction set")]
    MerkleMismatch,
    #[error("timestamp too far in the future")]
    TimestampInFuture,
    #[error("non-genesis block timestamp must exceed parent timestamp")]
    TimestampNotMonotonic,
    #[error("nonce out of range")]
    NonceOutOfRange,
    #[error("difficulty below minimum")]
    DifficultyTooLow,
    #[error("height discontinuity")]
    HeightDiscontinuity,
    #[error("genesis block must have zero prev_hash")]
    BadGenesisPrevHash,
    #[error("proof-of-work target not met")]
    PowNotMet,
}

/// Computes the merkle root over transaction hashes with odd-count
/// duplication (last hash repeated). The empty-tree root is the all-zero
/// 32-byte value (wire form `"0"*64`).
pub fn compute_merkle_root(tx_hashes: &[Hash32]) -> Hash32 {
    if tx_hashes.is_empty() {
        return ZERO_HASH;
    }
    let mut level: Vec<Hash32> = tx_hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks(2)
            .map(|pair| hash_sha3_256_concat(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

impl Block {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_hash: self.prev_hash,
            merkle_root: self.merkle_root,
            timestamp: self.timestamp,
            height: self.height,
            difficulty: self.difficulty,
            nonce: self.nonce,
        }
    }

    pub fn compute_merkle_root(&self) -> Hash32 {
        let hashes: Vec<Hash32> = self.transactions.iter().map(|tx| tx.hash).collect();
        compute_merkle_root(&hashes)
    }

    pub fn compute_hash(&self) -> Hash32 {
        self.header().compute_hash()
    }

    pub fn finalize_hash(&mut self) {
        self.merkle_root = self.compute_merkle_root();
        self.hash = self.compute_hash();
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    /// Structural validation per §3's Block invariants, except the PoW target
    /// check (callers that have a `PowEngine` handy call `pow::meets_target`
    /// separately — this keeps `primitives` free of a dependency on `pow`).
    pub fn validate_structure(&self, now: u64, parent: Option<&Block>) -> Result<(), BlockError> {
        if self.transactions.is_empty() {
            return Err(BlockError::Empty);
        }
        if !self.transactions[0].is_coinbase() {
            return Err(BlockError::MissingCoinbase);
        }
        if self.compute_hash() != self.hash {
            return Err(BlockError::HashMismatch);
        }
        if self.compute_merkle_root() != self.merkle_root {
            return Err(BlockError::MerkleMismatch);
        }
        if self.timestamp > now + crate::config::FUTURE_DRIFT_SECS {
            return Err(BlockError::TimestampInFuture);
        }
        if self.nonce >= (1u64 << 32) {
            return Err(BlockError::NonceOutOfRange);
        }
        if self.difficulty < crate::config::MIN_DIFFICULTY {
            return Err(BlockError::DifficultyTooLow);
        }
        match parent {
            None => {
                if self.height != 0 || self.prev_hash != GENESIS_PREV_HASH {
                    return Err(BlockError::BadGenesisPrevHash);
                }
            }
            Some(parent) => {
                if self.height != parent.height + 1 {
                    return Err(BlockError::HeightDiscontinuity);
                }
                if self.timestamp <= parent.timestamp {
                    return Err(BlockError::TimestampNotMonotonic);
                }
            }
        }
        Ok(())
    }
}
