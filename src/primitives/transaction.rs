// Transaction data model (§3 of the data model, account-based ledger).
//
// Despite the vestigial "inputs/outputs" terminology this is not a UTXO
// graph: inputs name a sender address and a claimed spend amount, outputs
// name a recipient address and a credited amount — the account db is
// balance-keyed, inputs/outputs only describe *intent* for a given tx.

use crate::crypto::falcon::{self, PublicKey, Signature};
use crate::crypto::hash::{hash_canonical_json, Hash32};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const MAX_TX_SIZE_BYTES: usize = crate::config::MAX_TX_SIZE_BYTES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRef {
    pub address: String,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRef {
    pub address: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub timestamp: u64,
    pub inputs: Vec<InputRef>,
    pub outputs: Vec<OutputRef>,
    #[serde(default)]
    pub data: String,
    pub fee: f64,
    #[serde(default)]
    pub public_key: Option<Vec<u8>>,
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
    #[serde(skip)]
    pub hash: Hash32,
}

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("transaction exceeds max size")]
    TooLarge,
    #[error("transaction is missing its signature")]
    MissingSignature,
    #[error("signature does not verify")]
    BadSignature,
    #[error("public key required to verify a signed transaction")]
    MissingPublicKey,
    #[error("outputs plus fee exceed declared input amount")]
    Unbalanced,
    #[error("empty outputs")]
    NoOutputs,
}

impl Transaction {
    /// Builds the canonical JSON image used for hashing: `public_key` and
    /// `signature` are excluded so the mempool's pubkey-stripping
    /// optimization (§4.6 step 8) never changes a transaction's hash.
    pub fn canonical_value_for_hash(&self) -> serde_json::Value {
        json!({
            "version": self.version,
            "timestamp": self.timestamp,
            "inputs": self.inputs,
            "outputs": self.outputs,
            "data": self.data,
            "fee": self.fee,
        })
    }

    pub fn compute_hash(&self) -> Hash32 {
        hash_canonical_json(&self.canonical_value_for_hash())
    }

    /// Recomputes and stores `self.hash`. Call after building or mutating a
    /// transaction and before it is inserted anywhere hash identity matters.
    pub fn finalize_hash(&mut self) {
        self.hash = self.compute_hash();
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn total_output_amount(&self) -> f64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    pub fn total_input_amount(&self) -> f64 {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// Structural + signature validation. Does not touch the ledger — callers
    /// needing balance feasibility do that separately (mempool/chain).
    pub fn validate(&self) -> Result<(), TxError> {
        if self.estimated_size() > MAX_TX_SIZE_BYTES {
            return Err(TxError::TooLarge);
        }
        if self.outputs.is_empty() {
            return Err(TxError::NoOutputs);
        }
        if !self.is_coinbase() {
            if self.total_output_amount() + self.fee > self.total_input_amount() + 1e-12 {
                return Err(TxError::Unbalanced);
            }
            let pk_bytes = self.public_key.as_ref().ok_or(TxError::MissingPublicKey)?;
            let sig_bytes = self.signature.as_ref().ok_or(TxError::MissingSignature)?;
            let pk = PublicKey(pk_bytes.clone());
            let sig = Signature(sig_bytes.clone());
            if !falcon::verify(&self.hash, &sig, &pk) {
                return Err(TxError::BadSignature);
            }
        }
        Ok(())
    }

    /// Signs the transaction in place: computes the hash, signs it, and
    /// attaches both public key and signature.
    pub fn sign(&mut self, pk: &PublicKey, sk: &crate::crypto::falcon::SecretKey) {
        self.finalize_hash();
        let sig = falcon::sign(&self.hash, sk);
        self.public_key = Some(pk.0.clone());
        self.signature = Some(sig.0);
    }

    /// Builds a coinbase transaction minting `reward` to `miner_address`.
    pub fn coinbase(miner_address: &str, reward: f64, height: u32, timestamp: u64) -> Self {
        let mut tx = Transaction {
            version: 1,
            timestamp,
            inputs: Vec::new(),
            outputs: vec![OutputRef {
                address: miner_address.to_string(),
                amount: reward,
            }],
            data: format!("coinbase:{height}"),
            fee: 0.0,
            public_key: None,
            signature: None,
            hash: crate::crypto::hash::ZERO_HASH,
        };
        tx.finalize_hash();
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signed_tx() -> Transaction {
        let (pk, sk) = falcon::generate_keypair();
        let mut tx = Transaction {
            version: 1,
            timestamp: 1_700_000_000,
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
            public_key: None,
            signature: None,
            hash: crate::crypto::hash::ZERO_HASH,
        };
        tx.sign(&pk, &sk);
        tx
    }

    #[test]
    fn test_hash_excludes_pubkey_and_signature() {
        let mut tx = sample_signed_tx();
        let hash_before = tx.hash;
        tx.public_key = None;
        tx.signature = None;
        assert_eq!(tx.compute_hash(), hash_before);
    }

    #[test]
    fn test_valid_signed_tx_passes_validation() {
        let tx = sample_signed_tx();
        assert!(tx.validate().is_ok());
    }

    #[test]
    fn test_tampered_signature_fails() {
        let mut tx = sample_signed_tx();
        let mut sig = tx.signature.clone().unwrap();
        let last = sig.len() - 1;
        sig[last] ^= 0xFF;
        tx.signature = Some(sig);
        assert!(matches!(tx.validate(), Err(TxError::BadSignature)));
    }

    #[test]
    fn test_unbalanced_rejected() {
        let mut tx = sample_signed_tx();
        tx.outputs[0].amount = 20.0;
        tx.finalize_hash();
        assert!(matches!(tx.validate(), Err(TxError::Unbalanced)));
    }

    #[test]
    fn test_coinbase_has_no_inputs_and_skips_signature_check() {
        let tx = Transaction::coinbase("Qminer", 2.5, 1, 1_700_000_100);
        assert!(tx.is_coinbase());
        assert!(tx.validate().is_ok());
    }

    #[test]
    fn test_serialization_roundtrip_preserves_fields() {
        let tx = sample_signed_tx();
        let bytes = crate::codec::serialize_transaction(&tx);
        let decoded = crate::codec::deserialize_transaction(&bytes).unwrap();
        assert_eq!(decoded.hash, tx.hash);
        assert_eq!(decoded.inputs, tx.inputs);
        assert_eq!(decoded.outputs, tx.outputs);
        assert_eq!(decoded.public_key, tx.public_key);
        assert_eq!(decoded.signature, tx.signature);
    }
}
