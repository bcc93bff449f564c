// Block Store (C3): append-only `blkNNNNN.dat` files with magic-framed
// records, plus a persisted hash→location and height→hash index.
//
// No embedded KV/LSM engine here — this supersedes the teacher's sled/
// RocksDB chain store, which doesn't match this file-and-index design.

use crate::codec::{deserialize_block, serialize_block};
use crate::config::MAX_BLOCK_FILE_SIZE;
use crate::crypto::hash::Hash32;
use crate::error::StorageError;
use crate::primitives::block::Block;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const RECORD_MAGIC: [u8; 4] = [0xF9, 0xBE, 0xB4, 0xD9];
const INDEX_VERSION: u32 = 1;
const INDEX_FILE_NAME: &str = "blockindex.dat";

#[derive(Debug, Clone, Copy)]
struct Location {
    file_num: u32,
    offset: u32,
    size: u32,
}

pub struct BlockStore {
    dir: PathBuf,
    current_file_num: u32,
    current_file_size: u64,
    max_file_size: u64,
    hash_index: HashMap<Hash32, Location>,
    height_index: HashMap<u32, Hash32>,
}

impl BlockStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        Self::open_with_max_file_size(dir, MAX_BLOCK_FILE_SIZE)
    }

    /// Like `open`, but with an overridable file-size cap — used by tests
    /// exercising rotation without writing 128 MiB of blocks.
    pub fn open_with_max_file_size<P: AsRef<Path>>(dir: P, max_file_size: u64) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut store = BlockStore {
            dir,
            current_file_num: 0,
            current_file_size: 0,
            max_file_size,
            hash_index: HashMap::new(),
            height_index: HashMap::new(),
        };

        if store.index_path().exists() {
            store.load_index()?;
        } else {
            store.rebuild_index()?;
        }
        store.locate_current_file();
        Ok(store)
    }

    fn block_file_path(&self, file_num: u32) -> PathBuf {
        self.dir.join(format!("blk{file_num:05}.dat"))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE_NAME)
    }

    fn locate_current_file(&mut self) {
        let max_file_num = self
            .hash_index
            .values()
            .map(|loc| loc.file_num)
            .max()
            .unwrap_or(0);
        self.current_file_num = max_file_num;
        self.current_file_size = self
            .block_file_path(max_file_num)
            .metadata()
            .map(|m| m.len())
            .unwrap_or(0);
    }

    pub fn has(&self, hash: &Hash32) -> bool {
        self.hash_index.contains_key(hash)
    }

    /// Stores a block, idempotent on hash. Height collisions against an
    /// existing entry at that height are logged and stored anyway — no
    /// reorg logic follows (§9 design note: "no reorgs").
    pub fn store(&mut self, block: &Block) -> Result<bool, StorageError> {
        if self.has(&block.hash) {
            return Ok(true);
        }

        let payload = serialize_block(block);
        let mut record = Vec::with_capacity(8 + payload.len());
        record.extend_from_slice(&RECORD_MAGIC);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&payload);

        if self.current_file_size + record.len() as u64 > self.max_file_size {
            self.current_file_num += 1;
            self.current_file_size = 0;
        }

        let path = self.block_file_path(self.current_file_num);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = self.current_file_size as u32;
        file.write_all(&record)?;
        file.sync_all()?;

        self.current_file_size += record.len() as u64;

        self.hash_index.insert(
            block.hash,
            Location {
                file_num: self.current_file_num,
                offset,
                size: payload.len() as u32,
            },
        );

        if let Some(existing) = self.height_index.get(&block.height) {
            if existing != &block.hash {
                warn!(
                    height = block.height,
                    "height collision in block store: existing and new hash differ, storing anyway (no reorgs)"
                );
            }
        }
        self.height_index.insert(block.height, block.hash);

        self.persist_index()?;
        Ok(true)
    }

    fn read_at(&self, loc: Location) -> Result<Block, StorageError> {
        let path = self.block_file_path(loc.file_num);
        let mut file = File::open(path)?;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(loc.offset as u64 + 8))?;
        let mut buf = vec![0u8; loc.size as usize];
        file.read_exact(&mut buf)?;
        Ok(deserialize_block(&buf)?)
    }

    pub fn get_by_hash(&self, hash: &Hash32) -> Result<Option<Block>, StorageError> {
        match self.hash_index.get(hash) {
            Some(&loc) => Ok(Some(self.read_at(loc)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_height(&self, height: u32) -> Result<Option<Block>, StorageError> {
        match self.height_index.get(&height) {
            Some(hash) => self.get_by_hash(hash),
            None => Ok(None),
        }
    }

    fn persist_index(&self) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.hash_index.len() as u32).to_le_bytes());
        for (hash, loc) in &self.hash_index {
            buf.extend_from_slice(hash);
            buf.extend_from_slice(&loc.file_num.to_le_bytes());
            buf.extend_from_slice(&loc.offset.to_le_bytes());
            buf.extend_from_slice(&loc.size.to_le_bytes());
            let height = self
                .height_index
                .iter()
                .find(|(_, h)| *h == hash)
                .map(|(h, _)| *h as i32)
                .unwrap_or(-1);
            buf.extend_from_slice(&height.to_le_bytes());
        }

        let tmp_path = self.index_path().with_extension("tmp");
        {
            let mut f = File::create(&tmp_path)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, self.index_path())?;
        Ok(())
    }

    fn load_index(&mut self) -> Result<(), StorageError> {
        let mut data = Vec::new();
        File::open(self.index_path())?.read_to_end(&mut data)?;
        if data.len() < 8 {
            return self.rebuild_index();
        }
        let mut pos = 0usize;
        let _version = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let count = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        pos += 4;

        self.hash_index.clear();
        self.height_index.clear();

        for _ in 0..count {
            if pos + 32 + 4 + 4 + 4 + 4 > data.len() {
                return self.rebuild_index();
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&data[pos..pos + 32]);
            pos += 32;
            let file_num = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let offset = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let size = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let height = i32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            pos += 4;

            self.hash_index.insert(hash, Location { file_num, offset, size });
            if height >= 0 {
                self.height_index.insert(height as u32, hash);
            }
        }
        Ok(())
    }

    /// Recovery path: scans every `blkNNNNN.dat` file for the record magic
    /// and re-deserializes each block, rebuilding both in-memory indexes.
    pub fn rebuild_index(&mut self) -> Result<(), StorageError> {
        self.hash_index.clear();
        self.height_index.clear();

        let mut file_num = 0u32;
        loop {
            let path = self.block_file_path(file_num);
            if !path.exists() {
                break;
            }
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;

            let mut pos = 0usize;
            while pos + 8 <= data.len() {
                if &data[pos..pos + 4] != RECORD_MAGIC {
                    break;
                }
                let size = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
                let payload_start = pos + 8;
                if payload_start + size > data.len() {
                    break;
                }
                let payload = &data[payload_start..payload_start + size];
                match deserialize_block(payload) {
                    Ok(block) => {
                        self.hash_index.insert(
                            block.hash,
                            Location {
                                file_num,
                                offset: pos as u32,
                                size: size as u32,
                            },
                        );
                        self.height_index.insert(block.height, block.hash);
                    }
                    Err(_) => return Err(StorageError::CorruptRecord(pos as u64)),
                }
                pos = payload_start + size;
            }
            file_num += 1;
        }

        self.persist_index()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::transaction::Transaction;
    use serde_json::Map;
    use tempfile::tempdir;

    fn sample_block(height: u32, prev_hash: Hash32, ts: u64) -> Block {
        let coinbase = Transaction::coinbase("Qminer", 2.5, height, ts);
        let mut b = Block {
            version: 1,
            prev_hash,
            merkle_root: crate::crypto::hash::ZERO_HASH,
            timestamp: ts,
            height,
            difficulty: 0.001,
            nonce: 0,
            hash: crate::crypto::hash::ZERO_HASH,
            transactions: vec![coinbase],
            extra_data: Map::new(),
        };
        b.finalize_hash();
        b
    }

    #[test]
    fn test_store_and_retrieve() {
        let dir = tempdir().unwrap();
        let mut store = BlockStore::open(dir.path()).unwrap();
        let b = sample_block(0, crate::crypto::hash::ZERO_HASH, 1_700_000_000);
        assert!(store.store(&b).unwrap());
        assert!(store.has(&b.hash));
        let fetched = store.get_by_hash(&b.hash).unwrap().unwrap();
        assert_eq!(fetched.hash, b.hash);
        let by_height = store.get_by_height(0).unwrap().unwrap();
        assert_eq!(by_height.hash, b.hash);
    }

    #[test]
    fn test_store_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = BlockStore::open(dir.path()).unwrap();
        let b = sample_block(0, crate::crypto::hash::ZERO_HASH, 1_700_000_000);
        assert!(store.store(&b).unwrap());
        assert!(store.store(&b).unwrap());
    }

    #[test]
    fn test_rebuild_index_matches_original() {
        let dir = tempdir().unwrap();
        let mut store = BlockStore::open(dir.path()).unwrap();
        let genesis = sample_block(0, crate::crypto::hash::ZERO_HASH, 1_700_000_000);
        store.store(&genesis).unwrap();
        let b1 = sample_block(1, genesis.hash, 1_700_000_100);
        store.store(&b1).unwrap();

        store.rebuild_index().unwrap();
        assert!(store.has(&genesis.hash));
        assert!(store.has(&b1.hash));
        assert_eq!(store.get_by_height(1).unwrap().unwrap().hash, b1.hash);
    }

    #[test]
    fn test_file_rotation() {
        let dir = tempdir().unwrap();
        let mut store = BlockStore::open_with_max_file_size(dir.path(), 1024).unwrap();
        let mut prev = crate::crypto::hash::ZERO_HASH;
        let mut hashes = Vec::new();
        for h in 0..20 {
            let b = sample_block(h, prev, 1_700_000_000 + h as u64);
            prev = b.hash;
            hashes.push(b.hash);
            store.store(&b).unwrap();
        }
        assert!(dir.path().join("blk00001.dat").exists(), "expected rotation into a second file");
        for (h, hash) in hashes.iter().enumerate() {
            assert_eq!(store.get_by_hash(hash).unwrap().unwrap().height, h as u32);
        }
    }
}
