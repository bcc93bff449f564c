// Transaction Mempool (C6): admission pipeline, fee-ordered block template
// selection, expiry, and `mempool.dat` snapshot persistence. Supersedes the
// teacher's replace-by-fee/nonce-indexed pool: this ledger has no per-sender
// nonce, so admission is keyed on `(prev_tx, output_index)` double-spend
// pairs instead.

use crate::config;
use crate::crypto::falcon::{self, PublicKey};
use crate::crypto::hash::{hash_to_hex, Hash32};
use crate::error::MempoolError;
use crate::primitives::block::Block;
use crate::primitives::transaction::Transaction;
use crate::storage::account_db::AccountDb;
use crate::storage::block_store::BlockStore;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone)]
struct Entry {
    tx: Transaction,
    received_time: u64,
    size_bytes: usize,
    fee_per_kb: f64,
}

struct Inner {
    entries: HashMap<Hash32, Entry>,
    by_address: HashMap<String, HashSet<Hash32>>,
    total_size: usize,
}

pub struct Mempool {
    inner: Mutex<Inner>,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        Mempool {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                by_address: HashMap::new(),
                total_size: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn addresses_of(tx: &Transaction) -> Vec<String> {
        let mut addrs: Vec<String> = tx.inputs.iter().map(|i| i.address.clone()).collect();
        addrs.extend(tx.outputs.iter().map(|o| o.address.clone()));
        addrs
    }

    /// Runs the 9-step admission pipeline against the confirmed ledger state
    /// in `accounts`. `now` is the caller-supplied wall-clock time in secs.
    pub fn add_transaction(
        &self,
        mut tx: Transaction,
        accounts: &AccountDb,
        store: &BlockStore,
        now: u64,
    ) -> Result<bool, MempoolError> {
        let mut inner = self.inner.lock().unwrap();

        // 1. Dedup on hash.
        if inner.entries.contains_key(&tx.hash) {
            return Err(MempoolError::Duplicate);
        }

        if !tx.is_coinbase() {
            // 2. Recover a missing public key from the sender's first-seen block.
            if tx.public_key.is_none() {
                let sender = &tx.inputs[0].address;
                let account = accounts
                    .get_account(sender)
                    .map_err(|_| MempoolError::Validation("account lookup failed"))?;
                let pubkey_block = account.and_then(|a| a.pubkey_block).ok_or(MempoolError::BadSignature)?;
                let block = store
                    .get_by_height(pubkey_block)
                    .map_err(|_| MempoolError::Validation("block store lookup failed"))?
                    .ok_or(MempoolError::BadSignature)?;
                let recovered = block
                    .transactions
                    .iter()
                    .find(|t| t.public_key.is_some() && t.inputs.iter().any(|i| &i.address == sender))
                    .and_then(|t| t.public_key.clone())
                    .ok_or(MempoolError::BadSignature)?;
                tx.public_key = Some(recovered);
            }

            // 3. Verify the Falcon-512 signature.
            let pk = PublicKey(tx.public_key.clone().unwrap());
            let sig_bytes = tx.signature.clone().ok_or(MempoolError::BadSignature)?;
            if !falcon::verify(&tx.hash, &crate::crypto::falcon::Signature(sig_bytes), &pk) {
                return Err(MempoolError::BadSignature);
            }

            // 4. Double-spend check on (prev_tx, output_index) pairs.
            for input in &tx.inputs {
                if let (Some(prev_tx), Some(output_index)) = (&input.prev_tx, input.output_index) {
                    for existing_hash in inner.by_address.get(&input.address).into_iter().flatten() {
                        if let Some(existing) = inner.entries.get(existing_hash) {
                            let conflict = existing.tx.inputs.iter().any(|i| {
                                i.prev_tx.as_deref() == Some(prev_tx.as_str())
                                    && i.output_index == Some(output_index)
                            });
                            if conflict {
                                return Err(MempoolError::DoubleSpend(input.address.clone(), output_index));
                            }
                        }
                    }
                }
            }

            // 5. Balance feasibility against ledger minus in-flight mempool spend.
            let mut spend_by_address: HashMap<String, u64> = HashMap::new();
            for input in &tx.inputs {
                *spend_by_address.entry(input.address.clone()).or_insert(0) +=
                    config::quarks_from_amount(input.amount);
            }
            for (address, additional_spend) in &spend_by_address {
                let mut projected = accounts
                    .balance_quarks(address)
                    .map_err(|_| MempoolError::Validation("balance lookup failed"))? as i128;
                for existing_hash in inner.by_address.get(address).into_iter().flatten() {
                    if let Some(existing) = inner.entries.get(existing_hash) {
                        for i in &existing.tx.inputs {
                            if &i.address == address {
                                projected -= config::quarks_from_amount(i.amount) as i128;
                            }
                        }
                    }
                }
                projected -= *additional_spend as i128;
                if projected < 0 {
                    return Err(MempoolError::InsufficientBalance(address.clone()));
                }
            }
        }

        // 6. Full structural/signature validation.
        tx.validate().map_err(|_| MempoolError::Validation("transaction failed full validation"))?;

        let size = tx.estimated_size();
        let fee_per_kb = tx.fee / (size.max(1) as f64 / 1000.0);

        // 7. Evict lower fee-density entries if this insertion would overflow.
        if inner.total_size + size > config::MEMPOOL_MAX_SIZE_BYTES {
            let mut candidates: Vec<(Hash32, f64)> = inner
                .entries
                .iter()
                .map(|(h, e)| (*h, e.fee_per_kb))
                .collect();
            candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

            for (hash, density) in candidates {
                if density >= fee_per_kb {
                    break;
                }
                if inner.total_size + size <= config::MEMPOOL_MAX_SIZE_BYTES {
                    break;
                }
                remove_entry(&mut inner, &hash);
            }
            if inner.total_size + size > config::MEMPOOL_MAX_SIZE_BYTES {
                return Err(MempoolError::Full);
            }
        }

        // 8. Strip the public key if the sender's key is already on record.
        if !tx.is_coinbase() {
            if let Ok(Some(account)) = accounts.get_account(&tx.inputs[0].address) {
                if account.pubkey_block.is_some() {
                    tx.public_key = None;
                }
            }
        }

        // 9. Insert.
        let addresses = Self::addresses_of(&tx);
        let hash = tx.hash;
        inner.total_size += size;
        for addr in addresses {
            inner.by_address.entry(addr).or_default().insert(hash);
        }
        inner.entries.insert(
            hash,
            Entry { tx, received_time: now, size_bytes: size, fee_per_kb },
        );

        Ok(true)
    }

    /// Removes every mempool tx confirmed by `block`, plus any tx spending an
    /// output the block already consumed or touching an address the block
    /// touched (stale balance assumptions).
    pub fn remove_confirmed(&self, block: &Block) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let confirmed_hashes: HashSet<Hash32> = block.transactions.iter().map(|t| t.hash).collect();
        let touched_addresses: HashSet<String> = block
            .transactions
            .iter()
            .flat_map(|t| Self::addresses_of(t))
            .collect();

        let to_remove: Vec<Hash32> = inner
            .entries
            .iter()
            .filter(|(hash, entry)| {
                confirmed_hashes.contains(*hash)
                    || Self::addresses_of(&entry.tx).iter().any(|a| touched_addresses.contains(a))
            })
            .map(|(hash, _)| *hash)
            .collect();

        let count = to_remove.len();
        for hash in to_remove {
            remove_entry(&mut inner, &hash);
        }
        if count > 0 {
            info!(removed = count, height = block.height, "pruned confirmed/conflicting mempool entries");
        }
        count
    }

    /// Greedy fee_per_kb selection up to `max_size` bytes, in insertion order
    /// of the result.
    pub fn get_transactions_for_block(&self, max_size: usize) -> Vec<Transaction> {
        let inner = self.inner.lock().unwrap();
        let mut ordered: Vec<&Entry> = inner.entries.values().collect();
        ordered.sort_by(|a, b| b.fee_per_kb.partial_cmp(&a.fee_per_kb).unwrap());

        let mut selected = Vec::new();
        let mut total = 0usize;
        for entry in ordered {
            if total + entry.size_bytes > max_size {
                continue;
            }
            total += entry.size_bytes;
            selected.push(entry.tx.clone());
        }
        selected
    }

    pub fn expire_old_transactions(&self, now: u64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = now.saturating_sub(config::MEMPOOL_EXPIRY_HOURS * 3600);
        let expired: Vec<Hash32> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.received_time < cutoff)
            .map(|(h, _)| *h)
            .collect();
        let count = expired.len();
        for hash in expired {
            remove_entry(&mut inner, &hash);
        }
        count
    }

    pub fn snapshot(&self) -> Vec<Transaction> {
        self.inner.lock().unwrap().entries.values().map(|e| e.tx.clone()).collect()
    }

    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> std::io::Result<()> {
        let txs = self.snapshot();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(txs.len() as u32).to_le_bytes());
        for tx in &txs {
            let encoded = serde_json::to_vec(tx)?;
            buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            buf.extend_from_slice(&encoded);
        }
        std::fs::write(path, buf)
    }

    /// Loaded without re-verification; admission is re-applied the next time
    /// each entry is offered to the mempool via the miner/sync path.
    pub fn load_from_file<P: AsRef<std::path::Path>>(&self, path: P) -> std::io::Result<usize> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        if data.len() < 4 {
            return Ok(0);
        }
        let count = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let mut pos = 4usize;
        let mut inner = self.inner.lock().unwrap();
        let mut loaded = 0;
        for _ in 0..count {
            if pos + 4 > data.len() {
                break;
            }
            let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len > data.len() {
                break;
            }
            if let Ok(mut tx) = serde_json::from_slice::<Transaction>(&data[pos..pos + len]) {
                tx.finalize_hash();
                let hash = tx.hash;
                let size = tx.estimated_size();
                let fee_per_kb = tx.fee / (size.max(1) as f64 / 1000.0);
                let addresses = Self::addresses_of(&tx);
                for addr in addresses {
                    inner.by_address.entry(addr).or_default().insert(hash);
                }
                inner.total_size += size;
                inner.entries.insert(
                    hash,
                    Entry { tx, received_time: 0, size_bytes: size, fee_per_kb },
                );
                loaded += 1;
            }
            pos += len;
        }
        Ok(loaded)
    }

    pub fn hashes(&self) -> Vec<String> {
        self.inner.lock().unwrap().entries.keys().map(hash_to_hex).collect()
    }

    /// Looks up one pending transaction by its hex-encoded hash, for RPC/CLI
    /// lookups (`qbit-cli`'s transaction-status query, an RPC mempool
    /// endpoint) without requiring the caller to scan `snapshot()`.
    pub fn get_transaction(&self, hash_hex: &str) -> Option<Transaction> {
        let hash = crate::crypto::hash::hash_from_hex(hash_hex)?;
        self.inner.lock().unwrap().entries.get(&hash).map(|e| e.tx.clone())
    }

    /// Every pending transaction touching `address`, either as a sender or a
    /// recipient — an account's "pending" view alongside its confirmed
    /// balance.
    pub fn transactions_by_address(&self, address: &str) -> Vec<Transaction> {
        let inner = self.inner.lock().unwrap();
        let Some(hashes) = inner.by_address.get(address) else {
            return Vec::new();
        };
        hashes.iter().filter_map(|h| inner.entries.get(h).map(|e| e.tx.clone())).collect()
    }
}

fn remove_entry(inner: &mut Inner, hash: &Hash32) {
    if let Some(entry) = inner.entries.remove(hash) {
        inner.total_size = inner.total_size.saturating_sub(entry.size_bytes);
        for addr in Mempool::addresses_of(&entry.tx) {
            if let Some(set) = inner.by_address.get_mut(&addr) {
                set.remove(hash);
                if set.is_empty() {
                    inner.by_address.remove(&addr);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::transaction::{InputRef, OutputRef};
    use serde_json::Map;
    use tempfile::tempdir;

    fn funded_accounts(address: &str, amount: f64) -> (AccountDb, BlockStore) {
        let dir = tempdir().unwrap();
        let mut db = AccountDb::open(dir.path().join("accounts.sqlite")).unwrap();
        let mut store = BlockStore::open(dir.path().join("blocks")).unwrap();
        std::mem::forget(dir);
        let tx = Transaction::coinbase(address, amount, 0, 1_700_000_000);
        let mut b = crate::primitives::block::Block {
            version: 1,
            prev_hash: crate::crypto::hash::ZERO_HASH,
            merkle_root: crate::crypto::hash::ZERO_HASH,
            timestamp: 1_700_000_000,
            height: 0,
            difficulty: 0.001,
            nonce: 0,
            hash: crate::crypto::hash::ZERO_HASH,
            transactions: vec![tx],
            extra_data: Map::new(),
        };
        b.finalize_hash();
        db.process_block(&b).unwrap();
        store.store(&b).unwrap();
        (db, store)
    }

    fn signed_spend(sender_pk: &PublicKey, sender_sk: &crate::crypto::falcon::SecretKey, sender: &str, recipient: &str) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            timestamp: 1_700_000_100,
            inputs: vec![InputRef { address: sender.to_string(), amount: 10.0, prev_tx: None, output_index: None }],
            outputs: vec![OutputRef { address: recipient.to_string(), amount: 9.999 }],
            data: String::new(),
            fee: 0.001,
            public_key: None,
            signature: None,
            hash: crate::crypto::hash::ZERO_HASH,
        };
        tx.sign(sender_pk, sender_sk);
        tx
    }

    #[test]
    fn test_accepts_valid_signed_transaction() {
        let (pk, sk) = falcon::generate_keypair();
        let address = crate::crypto::keys::encode_address_string(&crate::crypto::keys::derive_address(&pk));
        let (accounts, store) = funded_accounts(&address, 100.0);
        let pool = Mempool::new();
        let tx = signed_spend(&pk, &sk, &address, "Qbob");
        assert!(pool.add_transaction(tx, &accounts, &store, 1_700_000_100).unwrap());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_rejects_duplicate() {
        let (pk, sk) = falcon::generate_keypair();
        let address = crate::crypto::keys::encode_address_string(&crate::crypto::keys::derive_address(&pk));
        let (accounts, store) = funded_accounts(&address, 100.0);
        let pool = Mempool::new();
        let tx = signed_spend(&pk, &sk, &address, "Qbob");
        pool.add_transaction(tx.clone(), &accounts, &store, 1_700_000_100).unwrap();
        assert!(matches!(pool.add_transaction(tx, &accounts, &store, 1_700_000_100), Err(MempoolError::Duplicate)));
    }

    #[test]
    fn test_rejects_insufficient_balance() {
        let (pk, sk) = falcon::generate_keypair();
        let address = crate::crypto::keys::encode_address_string(&crate::crypto::keys::derive_address(&pk));
        let (accounts, store) = funded_accounts(&address, 1.0);
        let pool = Mempool::new();
        let tx = signed_spend(&pk, &sk, &address, "Qbob");
        assert!(matches!(
            pool.add_transaction(tx, &accounts, &store, 1_700_000_100),
            Err(MempoolError::InsufficientBalance(_))
        ));
    }

    #[test]
    fn test_get_transactions_for_block_orders_by_fee_density() {
        let (pk, sk) = falcon::generate_keypair();
        let address = crate::crypto::keys::encode_address_string(&crate::crypto::keys::derive_address(&pk));
        let (accounts, store) = funded_accounts(&address, 1000.0);
        let pool = Mempool::new();

        let mut low_fee = signed_spend(&pk, &sk, &address, "Qbob");
        low_fee.fee = 0.0001;
        low_fee.outputs[0].amount = 9.9999;
        low_fee.sign(&pk, &sk);

        let mut high_fee = signed_spend(&pk, &sk, &address, "Qcarol");
        high_fee.fee = 1.0;
        high_fee.outputs[0].amount = 9.0;
        high_fee.sign(&pk, &sk);

        pool.add_transaction(low_fee.clone(), &accounts, &store, 1_700_000_100).unwrap();
        pool.add_transaction(high_fee.clone(), &accounts, &store, 1_700_000_100).unwrap();

        let selected = pool.get_transactions_for_block(1_000_000);
        assert_eq!(selected[0].hash, high_fee.hash);
    }

    #[test]
    fn test_remove_confirmed_clears_pool() {
        let (pk, sk) = falcon::generate_keypair();
        let address = crate::crypto::keys::encode_address_string(&crate::crypto::keys::derive_address(&pk));
        let (accounts, store) = funded_accounts(&address, 100.0);
        let pool = Mempool::new();
        let tx = signed_spend(&pk, &sk, &address, "Qbob");
        pool.add_transaction(tx.clone(), &accounts, &store, 1_700_000_100).unwrap();

        let block = crate::primitives::block::Block {
            version: 1,
            prev_hash: crate::crypto::hash::ZERO_HASH,
            merkle_root: crate::crypto::hash::ZERO_HASH,
            timestamp: 1_700_000_200,
            height: 1,
            difficulty: 0.001,
            nonce: 0,
            hash: crate::crypto::hash::ZERO_HASH,
            transactions: vec![tx],
            extra_data: Map::new(),
        };
        assert_eq!(pool.remove_confirmed(&block), 1);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_lookup_by_hash_and_address() {
        let (pk, sk) = falcon::generate_keypair();
        let address = crate::crypto::keys::encode_address_string(&crate::crypto::keys::derive_address(&pk));
        let (accounts, store) = funded_accounts(&address, 100.0);
        let pool = Mempool::new();
        let tx = signed_spend(&pk, &sk, &address, "Qbob");
        pool.add_transaction(tx.clone(), &accounts, &store, 1_700_000_100).unwrap();

        let found = pool.get_transaction(&hash_to_hex(&tx.hash)).unwrap();
        assert_eq!(found.hash, tx.hash);
        assert!(pool.get_transaction(&hash_to_hex(&crate::crypto::hash::ZERO_HASH)).is_none());

        assert_eq!(pool.transactions_by_address(&address).len(), 1);
        assert_eq!(pool.transactions_by_address("Qbob").len(), 1);
        assert!(pool.transactions_by_address("Qnobody").is_empty());
    }
}
