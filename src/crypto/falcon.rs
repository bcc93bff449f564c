// Falcon-512 Digital Signatures — NIST PQC standard (FN-DSA)
//
// Falcon is a lattice-based signature scheme built on NTRU lattices, chosen
// here for its compact signatures relative to other post-quantum schemes.
// Unlike Dilithium, Falcon public keys, secret keys and signatures are all
// variable-length, so the wrapper types here hold `Vec<u8>` rather than
// fixed-size arrays; validity of a byte string is delegated to
// `pqcrypto_traits::sign::{PublicKey, SecretKey, DetachedSignature}::from_bytes`.
//
// Key generation is non-deterministic (uses OS randomness); wallet identity
// stability across restarts is the keystore's job, not this module's.

use pqcrypto_falcon::falcon512;
use pqcrypto_traits::sign::{
    DetachedSignature as PqDetachedSig, PublicKey as PqPk, SecretKey as PqSk,
};

#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub Vec<u8>);

impl serde::Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
        Ok(PublicKey(bytes))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({} bytes)", self.0.len())
    }
}

#[derive(Clone)]
pub struct SecretKey(pub Vec<u8>);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub Vec<u8>);

impl serde::Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
        Ok(Signature(bytes))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// Generates a fresh Falcon-512 keypair from OS randomness.
pub fn generate_keypair() -> (PublicKey, SecretKey) {
    let (pk, sk) = falcon512::keypair();
    (PublicKey(pk.as_bytes().to_vec()), SecretKey(sk.as_bytes().to_vec()))
}

/// Signs a message with a Falcon-512 detached signature.
pub fn sign(message: &[u8], sk: &SecretKey) -> Signature {
    let pq_sk = falcon512::SecretKey::from_bytes(&sk.0).expect("secret key bytes are always valid");
    let det_sig = falcon512::detached_sign(message, &pq_sk);
    Signature(det_sig.as_bytes().to_vec())
}

/// Verifies a Falcon-512 detached signature. Returns false on any malformed
/// input — never panics, since `pk`/`sig` may come from an untrusted peer.
pub fn verify(message: &[u8], sig: &Signature, pk: &PublicKey) -> bool {
    let pq_pk = match falcon512::PublicKey::from_bytes(&pk.0) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let pq_sig = match falcon512::DetachedSignature::from_bytes(&sig.0) {
        Ok(s) => s,
        Err(_) => return false,
    };
    falcon512::verify_detached_signature(&pq_sig, message, &pq_pk).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let (pk, sk) = generate_keypair();
        let msg = b"qbitcoin genesis";
        let sig = sign(msg, &sk);
        assert!(verify(msg, &sig, &pk), "valid signature must verify");
    }

    #[test]
    fn test_wrong_message_fails() {
        let (pk, sk) = generate_keypair();
        let sig = sign(b"correct message", &sk);
        assert!(!verify(b"wrong message", &sig, &pk));
    }

    #[test]
    fn test_wrong_key_fails() {
        let (_pk1, sk1) = generate_keypair();
        let (pk2, _sk2) = generate_keypair();
        let sig = sign(b"test", &sk1);
        assert!(!verify(b"test", &sig, &pk2));
    }

    #[test]
    fn test_corrupted_signature_rejected() {
        let (pk, sk) = generate_keypair();
        let msg = b"qbitcoin";
        let mut sig = sign(msg, &sk);
        let last = sig.0.len() - 1;
        sig.0[last] ^= 0xFF;
        assert!(!verify(msg, &sig, &pk), "corrupted signature must fail");
    }

    #[test]
    fn test_malformed_key_rejected_not_panicking() {
        let (_pk, sk) = generate_keypair();
        let sig = sign(b"test", &sk);
        let bogus_pk = PublicKey(vec![0u8; 4]);
        assert!(!verify(b"test", &sig, &bogus_pk));
    }
}
