// Chain Manager (C5): owns the Block Store and Account DB, runs block
// admission, and persists chain tip state. Supersedes the teacher's reward-
// schedule/governance module entirely — there is no governance layer and no
// referral bonus in this ledger.

use crate::config;
use crate::crypto::hash::{hash_to_hex, Hash32, ZERO_HASH};
use crate::error::{StateError, StorageError};
use crate::mempool::Mempool;
use crate::pow::{self};
use crate::primitives::block::Block;
use crate::storage::account_db::AccountDb;
use crate::storage::block_store::BlockStore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Bounded FIFO cache of recently-seen blocks, avoiding repeated Block Store
/// reads for tip-adjacent lookups (parent fetch during admission, RPC
/// "latest blocks" queries).
const BLOCK_CACHE_CAPACITY: usize = 64;

struct BlockCache {
    order: VecDeque<Hash32>,
    entries: std::collections::HashMap<Hash32, Block>,
}

impl BlockCache {
    fn new() -> Self {
        BlockCache { order: VecDeque::new(), entries: std::collections::HashMap::new() }
    }

    fn get(&self, hash: &Hash32) -> Option<&Block> {
        self.entries.get(hash)
    }

    fn insert(&mut self, block: Block) {
        if self.entries.contains_key(&block.hash) {
            return;
        }
        if self.order.len() >= BLOCK_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(block.hash);
        self.entries.insert(block.hash, block);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainState {
    height: i64,
    best_hash: String,
    timestamp: u64,
    chain_id: u32,
}

pub struct ChainManager {
    lock: Mutex<()>,
    dir: PathBuf,
    chain_id: u32,
    current_height: std::sync::atomic::AtomicI64,
    best_hash: Mutex<Hash32>,
    store: Mutex<BlockStore>,
    accounts: Mutex<AccountDb>,
    cache: Mutex<BlockCache>,
}

impl ChainManager {
    pub fn open<P: AsRef<Path>>(dir: P, chain_id: u32) -> Result<Self, StateError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let store = BlockStore::open(dir.join("blocks"))?;
        let accounts = AccountDb::open(dir.join("accounts.sqlite"))?;

        let (height, best_hash) = match Self::load_chainstate(&dir) {
            Some(s) if s.chain_id == chain_id => {
                let hash = crate::crypto::hash::hash_from_hex(&s.best_hash).unwrap_or(ZERO_HASH);
                (s.height, hash)
            }
            _ => (-1, ZERO_HASH),
        };

        Ok(ChainManager {
            lock: Mutex::new(()),
            dir,
            chain_id,
            current_height: std::sync::atomic::AtomicI64::new(height),
            best_hash: Mutex::new(best_hash),
            store: Mutex::new(store),
            accounts: Mutex::new(accounts),
            cache: Mutex::new(BlockCache::new()),
        })
    }

    fn chainstate_path(&self) -> PathBuf {
        self.dir.join("chainstate.json")
    }

    fn load_chainstate(dir: &Path) -> Option<ChainState> {
        let data = std::fs::read(dir.join("chainstate.json")).ok()?;
        serde_json::from_slice(&data).ok()
    }

    fn persist_chainstate(&self) -> Result<(), StateError> {
        let state = ChainState {
            height: self.current_height.load(std::sync::atomic::Ordering::SeqCst),
            best_hash: hash_to_hex(&self.best_hash.lock().unwrap()),
            timestamp: now_secs(),
            chain_id: self.chain_id,
        };
        let bytes = serde_json::to_vec_pretty(&state).map_err(|_| {
            StateError::Validation("failed to encode chain state")
        })?;
        let tmp = self.chainstate_path().with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, self.chainstate_path())?;
        Ok(())
    }

    pub fn current_height(&self) -> i64 {
        self.current_height.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn best_hash(&self) -> Hash32 {
        *self.best_hash.lock().unwrap()
    }

    pub fn has_block(&self, hash: &Hash32) -> bool {
        self.cache.lock().unwrap().get(hash).is_some() || self.store.lock().unwrap().has(hash)
    }

    pub fn get_block_by_hash(&self, hash: &Hash32) -> Result<Option<Block>, StateError> {
        if let Some(b) = self.cache.lock().unwrap().get(hash) {
            return Ok(Some(b.clone()));
        }
        Ok(self.store.lock().unwrap().get_by_hash(hash)?)
    }

    pub fn get_block_by_height(&self, height: u32) -> Result<Option<Block>, StateError> {
        Ok(self.store.lock().unwrap().get_by_height(height)?)
    }

    pub fn balance(&self, address: &str) -> f64 {
        let quarks = self.accounts.lock().unwrap().balance_quarks(address).unwrap_or(0);
        config::amount_from_quarks(quarks)
    }

    /// The difficulty the *next* block (at `current_height + 1`) must carry.
    pub fn get_next_block_difficulty(&self) -> Result<f64, StateError> {
        let height = self.current_height();
        if height < 0 {
            return Ok(config::INITIAL_DIFFICULTY);
        }
        let tip = self
            .get_block_by_hash(&self.best_hash())?
            .ok_or(StateError::MissingParent)?;
        let next_height = (height + 1) as u32;
        self.expected_difficulty(next_height, &tip)
    }

    fn expected_difficulty(&self, next_height: u32, parent: &Block) -> Result<f64, StateError> {
        if !pow::is_retarget_height(next_height) {
            return Ok(parent.difficulty);
        }
        let window = config::DIFFICULTY_ADJUSTMENT_BLOCKS as u32;
        let window_start_height = next_height.saturating_sub(window);
        let window_start = self
            .get_block_by_height(window_start_height)?
            .ok_or(StateError::MissingParent)?;
        let actual_timespan = parent.timestamp.saturating_sub(window_start.timestamp);
        Ok(pow::calculate_next_difficulty(parent.difficulty, actual_timespan))
    }

    /// Admission pipeline per the Chain Manager's `add_block` sequence:
    /// dedup, structural + PoW validation, parent linkage, state transition,
    /// persistence, tip update, mempool reconciliation.
    pub fn add_block(&self, block: Block, mempool: &Mempool) -> Result<bool, StateError> {
        let _guard = self.lock.lock().unwrap();

        if self.has_block(&block.hash) {
            return Ok(true);
        }

        let height = self.current_height();
        let parent = if block.height == 0 {
            None
        } else {
            let prev = self
                .get_block_by_hash(&block.prev_hash)
                .map_err(|_| StateError::MissingParent)?
                .ok_or(StateError::MissingParent)?;
            Some(prev)
        };

        if let Err(e) = block.validate_structure(now_secs(), parent.as_ref()) {
            warn!(error = %e, height = block.height, "block failed structural validation");
            return Ok(false);
        }

        let target = pow::target_from_difficulty(block.difficulty);
        if !pow::meets_target(&block.hash, target) {
            warn!(height = block.height, "block failed to meet proof-of-work target");
            return Ok(false);
        }

        if block.height == 0 {
            if height >= 0 {
                warn!("rejecting genesis block: chain already initialized");
                return Ok(false);
            }
        } else {
            let parent = parent.as_ref().unwrap();
            if parent.height + 1 != block.height {
                return Err(StateError::HeightDiscontinuity {
                    expected: parent.height + 1,
                    got: block.height,
                });
            }
            if block.timestamp <= parent.timestamp {
                return Err(StateError::TimestampNotMonotonic);
            }
            let expected_difficulty = self.expected_difficulty(block.height, parent)?;
            if (block.difficulty - expected_difficulty).abs() > 1e-12 {
                return Err(StateError::DifficultyMismatch {
                    expected: expected_difficulty,
                    got: block.difficulty,
                });
            }
        }

        {
            let mut accounts = self.accounts.lock().unwrap();
            match accounts.process_block(&block) {
                Ok(()) => {}
                Err(StorageError::InsufficientBalance(addr)) => {
                    let err = StateError::InsufficientBalance(addr);
                    warn!(height = block.height, error = %err, "block rejected: insufficient balance during application");
                    return Ok(false);
                }
                Err(e) => return Err(StateError::Storage(e)),
            }
        }

        self.store.lock().unwrap().store(&block)?;
        self.cache.lock().unwrap().insert(block.clone());

        self.current_height
            .store(block.height as i64, std::sync::atomic::Ordering::SeqCst);
        *self.best_hash.lock().unwrap() = block.hash;
        self.persist_chainstate()?;

        let removed = mempool.remove_confirmed(&block);
        info!(height = block.height, hash = %hash_to_hex(&block.hash), removed_from_mempool = removed, "block accepted");

        Ok(true)
    }

    /// Display-only cumulative work over the last `max_blocks` blocks from
    /// the tip. Since difficulty here is already a linear multiplier of the
    /// difficulty-1 target (not a leading-zero-bit count), work accumulates
    /// as a plain sum of difficulty rather than a sum of `2^difficulty`.
    pub fn chain_work(&self, max_blocks: u32) -> Result<f64, StateError> {
        let height = self.current_height();
        if height < 0 {
            return Ok(0.0);
        }
        let mut total = 0.0;
        let mut h = height as u32;
        let mut counted = 0u32;
        loop {
            let block = self.get_block_by_height(h)?.ok_or(StateError::MissingParent)?;
            total += block.difficulty;
            counted += 1;
            if h == 0 || counted >= max_blocks {
                break;
            }
            h -= 1;
        }
        Ok(total)
    }

    /// Walks back from the tip re-checking each block's structural and PoW
    /// validity against its on-disk parent, stopping after `max_blocks` or at
    /// genesis. A diagnostic for store corruption, not part of admission —
    /// `add_block` already enforces these checks at write time.
    pub fn validate_chain(&self, max_blocks: u32) -> Result<bool, StateError> {
        let height = self.current_height();
        if height < 0 {
            return Ok(true);
        }
        let mut h = height as u32;
        let mut checked = 0u32;
        loop {
            let block = match self.get_block_by_height(h)? {
                Some(b) => b,
                None => return Ok(false),
            };
            let parent = if h == 0 { None } else { self.get_block_by_height(h - 1)? };
            if parent.is_none() && h != 0 {
                return Ok(false);
            }
            if block
                .validate_structure(block.timestamp + config::FUTURE_DRIFT_SECS, parent.as_ref())
                .is_err()
            {
                return Ok(false);
            }
            let target = pow::target_from_difficulty(block.difficulty);
            if !pow::meets_target(&block.hash, target) {
                return Ok(false);
            }
            checked += 1;
            if h == 0 || checked >= max_blocks {
                break;
            }
            h -= 1;
        }
        Ok(true)
    }

    pub fn accounts(&self) -> std::sync::MutexGuard<'_, AccountDb> {
        self.accounts.lock().unwrap()
    }

    pub fn store(&self) -> std::sync::MutexGuard<'_, BlockStore> {
        self.store.lock().unwrap()
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::transaction::Transaction;
    use serde_json::Map;
    use tempfile::tempdir;

    fn mine_genesis(address: &str, amount: f64) -> Block {
        let coinbase = Transaction::coinbase(address, amount, 0, 1_700_000_000);
        let mut b = Block {
            version: 1,
            prev_hash: ZERO_HASH,
            merkle_root: ZERO_HASH,
            timestamp: 1_700_000_000,
            height: 0,
            difficulty: config::INITIAL_DIFFICULTY,
            nonce: 0,
            hash: ZERO_HASH,
            transactions: vec![coinbase],
            extra_data: Map::new(),
        };
        let target = pow::target_from_difficulty(b.difficulty);
        let stop = std::sync::atomic::AtomicBool::new(false);
        let mut header = b.header();
        let hash = pow::mine(&mut header, target, &stop).unwrap();
        b.nonce = header.nonce;
        b.merkle_root = b.compute_merkle_root();
        b.hash = hash;
        b
    }

    #[test]
    fn test_genesis_admission() {
        let dir = tempdir().unwrap();
        let chain = ChainManager::open(dir.path(), 1).unwrap();
        let mempool = Mempool::new();
        let genesis = mine_genesis("Qtest", 20_000_000.0);
        assert!(chain.add_block(genesis.clone(), &mempool).unwrap());
        assert_eq!(chain.current_height(), 0);
        assert_eq!(chain.balance("Qtest"), 20_000_000.0);
        assert_eq!(chain.best_hash(), genesis.hash);
    }

    #[test]
    fn test_genesis_rejected_when_already_initialized() {
        let dir = tempdir().unwrap();
        let chain = ChainManager::open(dir.path(), 1).unwrap();
        let mempool = Mempool::new();
        let genesis = mine_genesis("Qtest", 20_000_000.0);
        assert!(chain.add_block(genesis.clone(), &mempool).unwrap());

        let mut other_genesis = mine_genesis("Qother", 20_000_000.0);
        other_genesis.timestamp += 1;
        assert!(!chain.add_block(other_genesis, &mempool).unwrap());
    }

    #[test]
    fn test_duplicate_block_is_idempotent() {
        let dir = tempdir().unwrap();
        let chain = ChainManager::open(dir.path(), 1).unwrap();
        let mempool = Mempool::new();
        let genesis = mine_genesis("Qtest", 20_000_000.0);
        assert!(chain.add_block(genesis.clone(), &mempool).unwrap());
        assert!(chain.add_block(genesis, &mempool).unwrap());
    }

    /// A block spending more than the sender's ledger balance must be a
    /// clean `Ok(false)` rejection, not a hard `Err` out of `add_block` —
    /// the block's own structural/PoW/difficulty checks all pass, the
    /// shortfall only surfaces once account application runs.
    #[test]
    fn test_insufficient_balance_rejects_block_cleanly() {
        use crate::crypto::falcon;
        use crate::primitives::transaction::{InputRef, OutputRef, Transaction};

        let dir = tempdir().unwrap();
        let chain = ChainManager::open(dir.path(), 1).unwrap();
        let mempool = Mempool::new();
        let genesis = mine_genesis("Qtest", 1.0);
        assert!(chain.add_block(genesis.clone(), &mempool).unwrap());

        let (pk, sk) = falcon::generate_keypair();
        let mut overspend = Transaction {
            version: 1,
            timestamp: 1_700_000_100,
            inputs: vec![InputRef {
                address: "Qtest".to_string(),
                amount: 1_000.0,
                prev_tx: None,
                output_index: None,
            }],
            outputs: vec![OutputRef { address: "Qbob".to_string(), amount: 999.999 }],
            data: String::new(),
            fee: 0.001,
            public_key: None,
            signature: None,
            hash: ZERO_HASH,
        };
        overspend.sign(&pk, &sk);

        let coinbase = Transaction::coinbase("Qminer", 2.5, 1, 1_700_000_100);
        let mut block1 = Block {
            version: 1,
            prev_hash: genesis.hash,
            merkle_root: ZERO_HASH,
            timestamp: 1_700_000_100,
            height: 1,
            difficulty: config::INITIAL_DIFFICULTY,
            nonce: 0,
            hash: ZERO_HASH,
            transactions: vec![coinbase, overspend],
            extra_data: Map::new(),
        };
        let target = pow::target_from_difficulty(block1.difficulty);
        let stop = std::sync::atomic::AtomicBool::new(false);
        let mut header = block1.header();
        let hash = pow::mine(&mut header, target, &stop).unwrap();
        block1.nonce = header.nonce;
        block1.merkle_root = block1.compute_merkle_root();
        block1.hash = hash;

        assert!(matches!(chain.add_block(block1, &mempool), Ok(false)));
        assert_eq!(chain.current_height(), 0);
    }

    #[test]
    fn test_chain_work_and_validate_chain_on_healthy_chain() {
        let dir = tempdir().unwrap();
        let chain = ChainManager::open(dir.path(), 1).unwrap();
        let mempool = Mempool::new();
        let genesis = mine_genesis("Qtest", 20_000_000.0);
        let expected_work = genesis.difficulty;
        assert!(chain.add_block(genesis, &mempool).unwrap());

        assert_eq!(chain.chain_work(1000).unwrap(), expected_work);
        assert!(chain.validate_chain(1000).unwrap());
    }

    #[test]
    fn test_validate_chain_empty_is_trivially_valid() {
        let dir = tempdir().unwrap();
        let chain = ChainManager::open(dir.path(), 1).unwrap();
        assert!(chain.validate_chain(1000).unwrap());
        assert_eq!(chain.chain_work(1000).unwrap(), 0.0);
    }
}
