// Deterministic binary (de)serialization of blocks and transactions (C1).
//
// Content hashes are computed over canonical JSON (see `crypto::hash`), not
// this binary form — the binary framing here exists purely for compact
// on-disk/wire storage. The two encodings carry the same logical fields so
// neither loses information relative to the other.

use crate::crypto::hash::{hash_from_hex, hash_to_hex, Hash32};
use crate::error::CodecError;
use crate::primitives::block::Block;
use crate::primitives::transaction::{InputRef, OutputRef, Transaction};
use serde_json::{Map, Value};

pub const BLOCK_MAGIC: &[u8; 4] = b"QBTH";
const HEADER_SIZE: u32 = 128;

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_u32(buf, b.len() as u32);
    buf.extend_from_slice(b);
}
fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::Truncated {
                expected: self.pos + n,
                got: self.data.len(),
            });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.need(n)?;
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn hash32(&mut self) -> Result<Hash32, CodecError> {
        let b = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(out)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::Malformed("invalid utf8"))
    }
}

/// Serializes a transaction to its length-prefixed fixed-field-order binary
/// form: version | timestamp | inputs | outputs | data | fee | pubkey? | sig? | hash.
pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, tx.version);
    put_u64(&mut buf, tx.timestamp);

    put_u32(&mut buf, tx.inputs.len() as u32);
    for input in &tx.inputs {
        put_string(&mut buf, &input.address);
        put_f64(&mut buf, input.amount);
        match &input.prev_tx {
            Some(h) => {
                buf.push(1);
                put_string(&mut buf, h);
            }
            None => buf.push(0),
        }
        match input.output_index {
            Some(idx) => {
                buf.push(1);
                put_u32(&mut buf, idx);
            }
            None => buf.push(0),
        }
    }

    put_u32(&mut buf, tx.outputs.len() as u32);
    for output in &tx.outputs {
        put_string(&mut buf, &output.address);
        put_f64(&mut buf, output.amount);
    }

    put_string(&mut buf, &tx.data);
    put_f64(&mut buf, tx.fee);

    match &tx.public_key {
        Some(pk) => {
            buf.push(1);
            put_bytes(&mut buf, pk);
        }
        None => buf.push(0),
    }
    match &tx.signature {
        Some(sig) => {
            buf.push(1);
            put_bytes(&mut buf, sig);
        }
        None => buf.push(0),
    }

    buf.extend_from_slice(&tx.hash);
    buf
}

pub fn deserialize_transaction(data: &[u8]) -> Result<Transaction, CodecError> {
    let mut r = Reader::new(data);
    let version = r.u32()?;
    let timestamp = r.u64()?;

    let input_count = r.u32()?;
    let mut inputs = Vec::with_capacity(input_count as usize);
    for _ in 0..input_count {
        let address = r.string()?;
        let amount = r.f64()?;
        let prev_tx = if r.u8()? == 1 { Some(r.string()?) } else { None };
        let output_index = if r.u8()? == 1 { Some(r.u32()?) } else { None };
        inputs.push(InputRef {
            address,
            amount,
            prev_tx,
            output_index,
        });
    }

    let output_count = r.u32()?;
    let mut outputs = Vec::with_capacity(output_count as usize);
    for _ in 0..output_count {
        let address = r.string()?;
        let amount = r.f64()?;
        outputs.push(OutputRef { address, amount });
    }

    let tx_data = r.string()?;
    let fee = r.f64()?;

    let public_key = if r.u8()? == 1 { Some(r.bytes()?) } else { None };
    let signature = if r.u8()? == 1 { Some(r.bytes()?) } else { None };
    let hash = r.hash32()?;

    Ok(Transaction {
        version,
        timestamp,
        inputs,
        outputs,
        data: tx_data,
        fee,
        public_key,
        signature,
        hash,
    })
}

/// Serializes a block to the `"QBTH"`-framed binary form described in §4.1/§6.
pub fn serialize_block(block: &Block) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(BLOCK_MAGIC);
    put_u32(&mut buf, HEADER_SIZE);

    put_u32(&mut buf, block.version);
    buf.extend_from_slice(&block.prev_hash);
    buf.extend_from_slice(&block.merkle_root);
    put_u64(&mut buf, block.timestamp);
    put_u32(&mut buf, block.height);
    put_f64(&mut buf, block.difficulty);
    put_u64(&mut buf, block.nonce);
    buf.extend_from_slice(&block.hash);

    put_u32(&mut buf, block.transactions.len() as u32);
    for tx in &block.transactions {
        let tx_bytes = serialize_transaction(tx);
        put_u32(&mut buf, tx_bytes.len() as u32);
        buf.extend_from_slice(&tx_bytes);
    }

    let extra_bytes = serde_json::to_vec(&block.extra_data).unwrap_or_default();
    put_u32(&mut buf, extra_bytes.len() as u32);
    buf.extend_from_slice(&extra_bytes);

    buf
}

pub fn deserialize_block(data: &[u8]) -> Result<Block, CodecError> {
    let mut r = Reader::new(data);
    let magic = r.take(4)?;
    if magic != BLOCK_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let header_size = r.u32()?;
    if header_size != HEADER_SIZE {
        return Err(CodecError::Malformed("unexpected header size"));
    }

    let version = r.u32()?;
    let prev_hash = r.hash32()?;
    let merkle_root = r.hash32()?;
    let timestamp = r.u64()?;
    let height = r.u32()?;
    let difficulty = r.f64()?;
    let nonce = r.u64()?;
    let hash = r.hash32()?;

    let tx_count = r.u32()?;
    let mut transactions = Vec::with_capacity(tx_count as usize);
    for _ in 0..tx_count {
        let tx_size = r.u32()? as usize;
        let tx_bytes = r.take(tx_size)?;
        transactions.push(deserialize_transaction(tx_bytes)?);
    }

    let extra_size = r.u32()? as usize;
    let extra_bytes = r.take(extra_size)?;
    let extra_data: Map<String, Value> = if extra_bytes.is_empty() {
        Map::new()
    } else {
        serde_json::from_slice(extra_bytes)?
    };

    Ok(Block {
        version,
        prev_hash,
        merkle_root,
        timestamp,
        height,
        difficulty,
        nonce,
        hash,
        transactions,
        extra_data,
    })
}

/// Converts a block to its wire JSON dict form (used by the `blocks`/`headers`
/// P2P messages and the status surface).
pub fn block_to_json(block: &Block) -> Value {
    serde_json::json!({
        "version": block.version,
        "prev_hash": hash_to_hex(&block.prev_hash),
        "merkle_root": hash_to_hex(&block.merkle_root),
        "timestamp": block.timestamp,
        "height": block.height,
        "difficulty": block.difficulty,
        "nonce": block.nonce,
        "hash": hash_to_hex(&block.hash),
        "transactions": block.transactions,
        "extra_data": block.extra_data,
    })
}

pub fn block_from_json(value: &Value) -> Result<Block, CodecError> {
    let get_str = |k: &str| -> Result<String, CodecError> {
        value
            .get(k)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(CodecError::Malformed("missing field"))
    };
    let prev_hash = hash_from_hex(&get_str("prev_hash")?).ok_or(CodecError::Malformed("prev_hash"))?;
    let merkle_root = hash_from_hex(&get_str("merkle_root")?).ok_or(CodecError::Malformed("merkle_root"))?;
    let hash = hash_from_hex(&get_str("hash")?).ok_or(CodecError::Malformed("hash"))?;
    let transactions: Vec<Transaction> = serde_json::from_value(
        value
            .get("transactions")
            .cloned()
            .ok_or(CodecError::Malformed("transactions"))?,
    )?;
    let extra_data: Map<String, Value> = value
        .get("extra_data")
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();

    Ok(Block {
        version: value.get("version").and_then(Value::as_u64).unwrap_or(1) as u32,
        prev_hash,
        merkle_root,
        timestamp: value.get("timestamp").and_then(Value::as_u64).ok_or(CodecError::Malformed("timestamp"))?,
        height: value.get("height").and_then(Value::as_u64).ok_or(CodecError::Malformed("height"))? as u32,
        difficulty: value.get("difficulty").and_then(Value::as_f64).ok_or(CodecError::Malformed("difficulty"))?,
        nonce: value.get("nonce").and_then(Value::as_u64).ok_or(CodecError::Malformed("nonce"))?,
        hash,
        transactions,
        extra_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::transaction::Transaction;
    use serde_json::Map;

    fn sample_block() -> Block {
        let coinbase = Transaction::coinbase("Qtest", 20_000_000.0, 0, 1_700_000_000);
        let mut b = Block {
            version: 1,
            prev_hash: crate::crypto::hash::ZERO_HASH,
            merkle_root: crate::crypto::hash::ZERO_HASH,
            timestamp: 1_700_000_000,
            height: 0,
            difficulty: 0.001,
            nonce: 42,
            hash: crate::crypto::hash::ZERO_HASH,
            transactions: vec![coinbase],
            extra_data: Map::new(),
        };
        b.finalize_hash();
        b
    }

    #[test]
    fn test_block_roundtrip() {
        let b = sample_block();
        let bytes = serialize_block(&b);
        let decoded = deserialize_block(&bytes).unwrap();
        assert_eq!(decoded.hash, b.hash);
        assert_eq!(decoded.height, b.height);
        assert_eq!(decoded.transactions.len(), b.transactions.len());
        assert_eq!(decoded.transactions[0].hash, b.transactions[0].hash);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = serialize_block(&sample_block());
        bytes[0] = b'X';
        assert!(matches!(deserialize_block(&bytes), Err(CodecError::BadMagic)));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let bytes = serialize_block(&sample_block());
        assert!(deserialize_block(&bytes[..10]).is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let b = sample_block();
        let value = block_to_json(&b);
        let decoded = block_from_json(&value).unwrap();
        assert_eq!(decoded.hash, b.hash);
        assert_eq!(decoded.transactions[0].hash, b.transactions[0].hash);
    }
}
