// Genesis bootstrap.
//
// When chain state is absent and no bootstrap peers are configured, the
// genesis block is synthesized from a local allocation manifest, mined at
// `INITIAL_DIFFICULTY`, and processed like any other block.
//
// The manifest is JSON rather than YAML: the dependency stack carries
// `serde_json` everywhere else (canonical hashing, chainstate, mempool
// snapshots) and no YAML crate is otherwise in use, so a second data format
// would be pure overhead for a file with one list of allocations.

use crate::config;
use crate::pow;
use crate::primitives::block::{Block, GENESIS_PREV_HASH};
use crate::primitives::transaction::{OutputRef, Transaction};
use serde::Deserialize;
use serde_json::Map;
use std::path::Path;
use std::sync::atomic::AtomicBool;

#[derive(Debug, Deserialize)]
pub struct Allocation {
    pub address: String,
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct GenesisManifest {
    pub timestamp: u64,
    pub allocations: Vec<Allocation>,
}

impl GenesisManifest {
    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Builds the unmined genesis block: a single coinbase-shaped transaction
/// with one output per allocation entry, no inputs, and a synthetic hash
/// fixed up by `finalize_hash` once assembled.
pub fn build_genesis_block(manifest: &GenesisManifest) -> Block {
    let outputs: Vec<OutputRef> = manifest
        .allocations
        .iter()
        .map(|a| OutputRef { address: a.address.clone(), amount: a.amount })
        .collect();

    let mut tx = Transaction {
        version: 1,
        timestamp: manifest.timestamp,
        inputs: Vec::new(),
        outputs,
        data: "genesis".to_string(),
        fee: 0.0,
        public_key: None,
        signature: None,
        hash: crate::crypto::hash::ZERO_HASH,
    };
    tx.finalize_hash();

    let mut block = Block {
        version: 1,
        prev_hash: GENESIS_PREV_HASH,
        merkle_root: crate::crypto::hash::ZERO_HASH,
        timestamp: manifest.timestamp,
        height: 0,
        difficulty: config::INITIAL_DIFFICULTY,
        nonce: 0,
        hash: crate::crypto::hash::ZERO_HASH,
        transactions: vec![tx],
        extra_data: Map::new(),
    };
    block.merkle_root = block.compute_merkle_root();
    block
}

/// Mines the genesis block's proof-of-work in place and returns it ready
/// for `ChainManager::add_block`.
pub fn mine_genesis_block(manifest: &GenesisManifest, stop: &AtomicBool) -> Result<Block, crate::error::PowError> {
    let mut block = build_genesis_block(manifest);
    let target = pow::target_from_difficulty(block.difficulty);
    let mut header = block.header();
    let hash = pow::mine(&mut header, target, stop)?;
    block.nonce = header.nonce;
    block.hash = hash;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> GenesisManifest {
        GenesisManifest {
            timestamp: 1_700_000_000,
            allocations: vec![Allocation { address: "Qtest".to_string(), amount: 20_000_000.0 }],
        }
    }

    #[test]
    fn test_genesis_structure() {
        let manifest = sample_manifest();
        let block = build_genesis_block(&manifest);
        assert_eq!(block.height, 0);
        assert_eq!(block.prev_hash, GENESIS_PREV_HASH);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.transactions[0].outputs[0].address, "Qtest");
    }

    #[test]
    fn test_mine_genesis_meets_target() {
        let manifest = sample_manifest();
        let stop = AtomicBool::new(false);
        let block = mine_genesis_block(&manifest, &stop).unwrap();
        let target = pow::target_from_difficulty(block.difficulty);
        assert!(pow::meets_target(&block.hash, target));
    }
}
