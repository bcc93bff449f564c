// Account DB (C4): compact ledger backed by an embedded relational store
// (`rusqlite`, bundled SQLite), matching the spec's "SQLite in source" line.
//
// Tables: accounts(address PK, balance, pubkey_block, tx_count),
// tx_blocks(address, block_num) indexed by block_num, last_block(height).
// All writes for one block are wrapped in a single transaction; any per-tx
// failure rolls back the whole block.

use crate::config::quarks_from_amount;
use crate::error::StorageError;
use crate::primitives::block::Block;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub struct AccountDb {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountState {
    pub balance_quarks: u64,
    pub pubkey_block: Option<u32>,
    pub tx_count: u32,
}

impl AccountDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                address     TEXT PRIMARY KEY,
                balance     INTEGER NOT NULL,
                pubkey_block INTEGER,
                tx_count    INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS tx_blocks (
                address   TEXT NOT NULL,
                block_num INTEGER NOT NULL,
                PRIMARY KEY (address, block_num)
            );
            CREATE INDEX IF NOT EXISTS idx_tx_blocks_block_num ON tx_blocks(block_num);
            CREATE TABLE IF NOT EXISTS last_block (
                height INTEGER PRIMARY KEY
            );
            ",
        )?;
        Ok(AccountDb { conn })
    }

    pub fn last_processed_height(&self) -> Result<Option<i64>, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT height FROM last_block LIMIT 1", [], |r| r.get(0))
            .optional()?)
    }

    pub fn get_account(&self, address: &str) -> Result<Option<AccountState>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT balance, pubkey_block, tx_count FROM accounts WHERE address = ?1",
                params![address],
                |r| {
                    Ok(AccountState {
                        balance_quarks: r.get::<_, i64>(0)? as u64,
                        pubkey_block: r.get::<_, Option<i64>>(1)?.map(|v| v as u32),
                        tx_count: r.get::<_, i64>(2)? as u32,
                    })
                },
            )
            .optional()?)
    }

    pub fn balance_quarks(&self, address: &str) -> Result<u64, StorageError> {
        Ok(self.get_account(address)?.map(|a| a.balance_quarks).unwrap_or(0))
    }

    pub fn total_supply_quarks(&self) -> Result<u64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COALESCE(SUM(balance), 0) FROM accounts", [], |r| {
                r.get::<_, i64>(0)
            })? as u64)
    }

    /// Applies a block's full state delta inside one SQL transaction, per
    /// §4.4's `process_block`. Idempotent on a genesis block once any block
    /// has already been processed.
    pub fn process_block(&mut self, block: &Block) -> Result<(), StorageError> {
        if block.height == 0 && self.last_processed_height()?.is_some() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        for txn in &block.transactions {
            if txn.is_coinbase() {
                for output in &txn.outputs {
                    credit(&tx, &output.address, quarks_from_amount(output.amount))?;
                    record_tx_block(&tx, &output.address, block.height)?;
                }
            } else {
                for input in &txn.inputs {
                    let spend = quarks_from_amount(input.amount);
                    let current = account_balance(&tx, &input.address)?;
                    if current < spend {
                        return Err(StorageError::InsufficientBalance(input.address.clone()));
                    }
                    debit(&tx, &input.address, spend)?;
                    if txn.public_key.is_some() {
                        set_pubkey_block_if_unset(&tx, &input.address, block.height)?;
                    }
                    record_tx_block(&tx, &input.address, block.height)?;
                }
                for output in &txn.outputs {
                    credit(&tx, &output.address, quarks_from_amount(output.amount))?;
                    record_tx_block(&tx, &output.address, block.height)?;
                }
            }
        }

        tx.execute("DELETE FROM last_block", [])?;
        tx.execute("INSERT INTO last_block (height) VALUES (?1)", params![block.height])?;
        tx.commit()?;
        Ok(())
    }

    /// Replays every block from genesis, recreating the ledger from scratch.
    pub fn rebuild_from_blocks(&mut self, store: &super::block_store::BlockStore) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "DELETE FROM accounts; DELETE FROM tx_blocks; DELETE FROM last_block;",
        )?;
        let mut height = 0u32;
        loop {
            match store.get_by_height(height)? {
                Some(block) => {
                    self.process_block(&block)?;
                    height += 1;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Every block height where `address` appears, per §3's secondary index.
    pub fn block_heights_for_address(&self, address: &str) -> Result<Vec<u32>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT block_num FROM tx_blocks WHERE address = ?1 ORDER BY block_num")?;
        let rows = stmt
            .query_map(params![address], |r| r.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|v| v as u32).collect())
    }
}

fn account_balance(tx: &rusqlite::Transaction, address: &str) -> Result<u64, StorageError> {
    Ok(tx
        .query_row(
            "SELECT balance FROM accounts WHERE address = ?1",
            params![address],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .unwrap_or(0) as u64)
}

fn credit(tx: &rusqlite::Transaction, address: &str, amount: u64) -> Result<(), StorageError> {
    tx.execute(
        "INSERT INTO accounts (address, balance, pubkey_block, tx_count) VALUES (?1, ?2, NULL, 1)
         ON CONFLICT(address) DO UPDATE SET balance = balance + ?2, tx_count = tx_count + 1",
        params![address, amount as i64],
    )?;
    Ok(())
}

fn debit(tx: &rusqlite::Transaction, address: &str, amount: u64) -> Result<(), StorageError> {
    tx.execute(
        "UPDATE accounts SET balance = balance - ?2, tx_count = tx_count + 1 WHERE address = ?1",
        params![address, amount as i64],
    )?;
    Ok(())
}

fn set_pubkey_block_if_unset(tx: &rusqlite::Transaction, address: &str, height: u32) -> Result<(), StorageError> {
    tx.execute(
        "UPDATE accounts SET pubkey_block = ?2 WHERE address = ?1 AND pubkey_block IS NULL",
        params![address, height],
    )?;
    Ok(())
}

fn record_tx_block(tx: &rusqlite::Transaction, address: &str, height: u32) -> Result<(), StorageError> {
    tx.execute(
        "INSERT OR IGNORE INTO tx_blocks (address, block_num) VALUES (?1, ?2)",
        params![address, height],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::transaction::{InputRef, OutputRef, Transaction};
    use serde_json::Map;
    use tempfile::tempdir;

    fn coinbase_block(height: u32, address: &str, amount: f64) -> Block {
        let tx = Transaction::coinbase(address, amount, height, 1_700_000_000 + height as u64);
        let mut b = Block {
            version: 1,
            prev_hash: crate::crypto::hash::ZERO_HASH,
            merkle_root: crate::crypto::hash::ZERO_HASH,
            timestamp: 1_700_000_000 + height as u64,
            height,
            difficulty: 0.001,
            nonce: 0,
            hash: crate::crypto::hash::ZERO_HASH,
            transactions: vec![tx],
            extra_data: Map::new(),
        };
        b.finalize_hash();
        b
    }

    #[test]
    fn test_genesis_credits_allocation() {
        let dir = tempdir().unwrap();
        let mut db = AccountDb::open(dir.path().join("accounts.sqlite")).unwrap();
        let genesis = coinbase_block(0, "Qtest", 20_000_000.0);
        db.process_block(&genesis).unwrap();
        assert_eq!(db.balance_quarks("Qtest"), Ok(quarks_from_amount(20_000_000.0)));
        assert_eq!(db.last_processed_height().unwrap(), Some(0));
    }

    #[test]
    fn test_genesis_idempotent() {
        let dir = tempdir().unwrap();
        let mut db = AccountDb::open(dir.path().join("accounts.sqlite")).unwrap();
        let genesis = coinbase_block(0, "Qtest", 20_000_000.0);
        db.process_block(&genesis).unwrap();
        db.process_block(&genesis).unwrap();
        assert_eq!(db.balance_quarks("Qtest"), Ok(quarks_from_amount(20_000_000.0)));
    }

    #[test]
    fn test_transfer_debits_and_credits() {
        let dir = tempdir().unwrap();
        let mut db = AccountDb::open(dir.path().join("accounts.sqlite")).unwrap();
        db.process_block(&coinbase_block(0, "Qtest", 20_000_000.0)).unwrap();

        let mut spend_tx = Transaction {
            version: 1,
            timestamp: 1_700_000_100,
            inputs: vec![InputRef {
                address: "Qtest".to_string(),
                amount: 10.0,
                prev_tx: None,
                output_index: None,
            }],
            outputs: vec![OutputRef {
                address: "Qbob".to_string(),
                amount: 9.999,
            }],
            data: String::new(),
            fee: 0.001,
            public_key: Some(vec![1, 2, 3]),
            signature: Some(vec![4, 5, 6]),
            hash: crate::crypto::hash::ZERO_HASH,
        };
        spend_tx.finalize_hash();

        let miner_tx = Transaction::coinbase("Qminer", 2.5, 1, 1_700_000_100);
        let mut block1 = Block {
            version: 1,
            prev_hash: crate::crypto::hash::ZERO_HASH,
            merkle_root: crate::crypto::hash::ZERO_HASH,
            timestamp: 1_700_000_100,
            height: 1,
            difficulty: 0.001,
            nonce: 0,
            hash: crate::crypto::hash::ZERO_HASH,
            transactions: vec![miner_tx, spend_tx],
            extra_data: Map::new(),
        };
        block1.finalize_hash();

        db.process_block(&block1).unwrap();

        assert_eq!(
            db.balance_quarks("Qtest").unwrap(),
            quarks_from_amount(20_000_000.0) - quarks_from_amount(10.0)
        );
        assert_eq!(db.balance_quarks("Qbob").unwrap(), quarks_from_amount(9.999));
        assert_eq!(db.balance_quarks("Qminer").unwrap(), quarks_from_amount(2.5));

        let account = db.get_account("Qtest").unwrap().unwrap();
        assert_eq!(account.pubkey_block, Some(1));
    }

    #[test]
    fn test_conservation_under_coinbase() {
        let dir = tempdir().unwrap();
        let mut db = AccountDb::open(dir.path().join("accounts.sqlite")).unwrap();
        let before = db.total_supply_quarks().unwrap();
        let block = coinbase_block(0, "Qtest", 20_000_000.0);
        db.process_block(&block).unwrap();
        let after = db.total_supply_quarks().unwrap();
        assert_eq!(after - before, quarks_from_amount(20_000_000.0));
    }
}
