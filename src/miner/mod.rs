// Miner (C7): assembles a candidate block from the chain tip and mempool,
// drives the PoW loop, submits it to the Chain Manager and hands the result
// off for broadcast.

use crate::config;
use crate::consensus::chain::ChainManager;
use crate::mempool::Mempool;
use crate::pow;
use crate::primitives::block::Block;
use crate::primitives::transaction::Transaction;
use serde_json::Map;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// `reward = INITIAL_REWARD >> (height / HALVING_INTERVAL)`, zero after
/// `MAX_HALVINGS` halvings (§4.7 step 2).
pub fn block_reward(height: u32) -> f64 {
    let halvings = height as u64 / config::HALVING_INTERVAL_BLOCKS;
    if halvings >= config::MAX_HALVINGS as u64 {
        return 0.0;
    }
    config::INITIAL_REWARD_QBIT / (1u64 << halvings) as f64
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Builds an unmined candidate block from the current tip and mempool.
pub fn build_candidate(chain: &ChainManager, mempool: &Mempool, reward_address: &str) -> Result<Block, crate::error::StateError> {
    let height = (chain.current_height() + 1).max(0) as u32;
    let prev_hash = if chain.current_height() < 0 {
        crate::crypto::hash::ZERO_HASH
    } else {
        chain.best_hash()
    };
    let difficulty = chain.get_next_block_difficulty()?;
    let timestamp = now_secs();

    let coinbase = Transaction::coinbase(reward_address, block_reward(height), height, timestamp);
    let mut transactions = vec![coinbase];
    transactions.extend(mempool.get_transactions_for_block(config::MAX_BLOCK_SIZE_BYTES));

    let mut block = Block {
        version: 1,
        prev_hash,
        merkle_root: crate::crypto::hash::ZERO_HASH,
        timestamp,
        height,
        difficulty,
        nonce: 0,
        hash: crate::crypto::hash::ZERO_HASH,
        transactions,
        extra_data: Map::new(),
    };
    block.merkle_root = block.compute_merkle_root();
    Ok(block)
}

/// Drives PoW to completion or cancellation and submits the result to the
/// Chain Manager. Returns `Ok(Some(block))` on a newly accepted block,
/// `Ok(None)` if mining was cancelled or the assembled block was rejected.
pub fn mine_one_block(
    chain: &ChainManager,
    mempool: &Mempool,
    reward_address: &str,
    stop: &AtomicBool,
) -> Result<Option<Block>, crate::error::StateError> {
    let mut block = build_candidate(chain, mempool, reward_address)?;
    let target = pow::target_from_difficulty(block.difficulty);
    let mut header = block.header();

    match pow::mine(&mut header, target, stop) {
        Ok(hash) => {
            block.nonce = header.nonce;
            block.hash = hash;
        }
        Err(_) => return Ok(None),
    }

    if chain.add_block(block.clone(), mempool)? {
        info!(height = block.height, "mined block");
        Ok(Some(block))
    } else {
        Ok(None)
    }
}

/// The miner thread loop: repeats `mine_one_block` until `stop` is set. A
/// stop check also brackets each iteration so cancellation between blocks is
/// prompt, not just mid-PoW.
pub fn run(chain: &ChainManager, mempool: &Mempool, reward_address: &str, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        match mine_one_block(chain, mempool, reward_address, stop) {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "miner iteration failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::genesis;
    use tempfile::tempdir;

    #[test]
    fn test_block_reward_halves() {
        assert_eq!(block_reward(0), config::INITIAL_REWARD_QBIT);
        assert_eq!(block_reward(config::HALVING_INTERVAL_BLOCKS as u32), config::INITIAL_REWARD_QBIT / 2.0);
    }

    #[test]
    fn test_block_reward_zero_after_max_halvings() {
        let height = (config::HALVING_INTERVAL_BLOCKS * config::MAX_HALVINGS as u64) as u32;
        assert_eq!(block_reward(height), 0.0);
    }

    #[test]
    fn test_mine_genesis_then_block_one() {
        let dir = tempdir().unwrap();
        let chain = ChainManager::open(dir.path(), 1).unwrap();
        let mempool = Mempool::new();

        let manifest = genesis::GenesisManifest {
            timestamp: 1_700_000_000,
            allocations: vec![genesis::Allocation { address: "Qtest".to_string(), amount: 20_000_000.0 }],
        };
        let stop = AtomicBool::new(false);
        let genesis_block = genesis::mine_genesis_block(&manifest, &stop).unwrap();
        assert!(chain.add_block(genesis_block, &mempool).unwrap());

        let mined = mine_one_block(&chain, &mempool, "Qminer", &stop).unwrap();
        assert!(mined.is_some());
        assert_eq!(chain.current_height(), 1);
        assert_eq!(chain.balance("Qminer"), config::INITIAL_REWARD_QBIT);
    }
}
