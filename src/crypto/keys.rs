// Address derivation and encoding.
//
// Addresses are opaque UTF-8 strings at the core boundary (ledger, mempool,
// wire protocol); this module is the wallet-side collaborator that derives a
// human-readable address from a Falcon-512 public key.

use crate::crypto::falcon::PublicKey;

pub const ADDRESS_BYTES: usize = 32;

/// Derives a Qbitcoin address from a Falcon-512 public key.
/// Rule: address = first 32 bytes of SHA-512(public_key).
pub fn derive_address(pk: &PublicKey) -> [u8; ADDRESS_BYTES] {
    let hash = super::hash::hash_sha512(&pk.0);
    let mut addr = [0u8; ADDRESS_BYTES];
    addr.copy_from_slice(&hash[0..ADDRESS_BYTES]);
    addr
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("invalid address prefix: must start with Q1")]
    InvalidPrefix,
    #[error("invalid address encoding")]
    InvalidEncoding,
    #[error("invalid address length")]
    InvalidLength,
    #[error("invalid address checksum")]
    InvalidChecksum,
}

/// Encodes an address into the human-readable base32 string.
/// Format: `Q1<base32_address><checksum>`.
pub fn encode_address_string(addr: &[u8; ADDRESS_BYTES]) -> String {
    let b32 = data_encoding::BASE32_NOPAD.encode(addr);

    let prefix = b"Q1";
    let mut payload = Vec::with_capacity(prefix.len() + addr.len());
    payload.extend_from_slice(prefix);
    payload.extend_from_slice(addr);

    let hash1 = super::hash::hash_sha3_256(&payload);
    let hash2 = super::hash::hash_sha3_256(&hash1);

    let checksum = data_encoding::BASE32_NOPAD.encode(&hash2[0..4]);

    format!("Q1{}{}", b32, checksum)
}

/// Decodes a human-readable Q1 address back to raw bytes.
pub fn decode_address_string(s: &str) -> Result<[u8; ADDRESS_BYTES], AddressError> {
    if !s.starts_with("Q1") {
        return Err(AddressError::InvalidPrefix);
    }

    let body = &s[2..];
    if body.len() < 8 {
        return Err(AddressError::InvalidLength);
    }

    let (addr_part, _checksum_part) = body.split_at(body.len() - 7);

    let addr_bytes = data_encoding::BASE32_NOPAD
        .decode(addr_part.as_bytes())
        .map_err(|_| AddressError::InvalidEncoding)?;

    if addr_bytes.len() != ADDRESS_BYTES {
        return Err(AddressError::InvalidLength);
    }

    let mut addr = [0u8; ADDRESS_BYTES];
    addr.copy_from_slice(&addr_bytes);

    let expected = encode_address_string(&addr);
    if expected == s {
        Ok(addr)
    } else {
        Err(AddressError::InvalidChecksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_derivation() {
        let pk = PublicKey(vec![1u8; 897]);
        let addr = derive_address(&pk);
        assert_eq!(addr.len(), 32);

        let addr_str = encode_address_string(&addr);
        assert!(addr_str.starts_with("Q1"), "address must start with Q1");

        let decoded = decode_address_string(&addr_str).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_bad_prefix_rejected() {
        assert!(matches!(
            decode_address_string("XYZ12345"),
            Err(AddressError::InvalidPrefix)
        ));
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let pk = PublicKey(vec![7u8; 897]);
        let addr = derive_address(&pk);
        let mut addr_str = encode_address_string(&addr);
        addr_str.push('A');
        assert!(decode_address_string(&addr_str).is_err());
    }
}
