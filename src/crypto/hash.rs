// Cryptographic hashing wrappers and canonical JSON encoding.
//
// Block and transaction hashes are computed over the canonical JSON encoding
// (sorted object keys) of a subset of fields, not the binary wire form — that
// lets the hash be exposed as a hex string over the wire without two
// divergent notions of "the hash" for the same logical object.

use serde_json::Value;
use sha2::{Digest, Sha512};
use sha3::Sha3_256;

pub type Hash32 = [u8; 32];

pub const ZERO_HASH: Hash32 = [0u8; 32];

/// SHA-512: used for address derivation.
pub fn hash_sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA3-256: used for proof-of-work, merkle trees, and canonical-JSON hashing.
pub fn hash_sha3_256(data: &[u8]) -> Hash32 {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hashes `a` then `b` without allocating a temporary concatenation buffer.
pub fn hash_sha3_256_concat(a: &[u8], b: &[u8]) -> Hash32 {
    let mut hasher = Sha3_256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Recursively sorts the keys of every JSON object in `value`, producing the
/// canonical form used for hashing and wire hex exposure.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serializes `value` to its canonical (sorted-key) JSON byte form.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(&canonicalize(value)).expect("Value serialization is infallible")
}

/// Hashes the canonical JSON encoding of `value`.
pub fn hash_canonical_json(value: &Value) -> Hash32 {
    hash_sha3_256(&canonical_json_bytes(value))
}

pub fn hash_to_hex(h: &Hash32) -> String {
    hex::encode(h)
}

pub fn hash_from_hex(s: &str) -> Option<Hash32> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}
