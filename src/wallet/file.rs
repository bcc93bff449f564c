// Wallet File Management
// Implements wallet.dat file format for persistent key storage

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, PasswordHasher};
use argon2::password_hash::SaltString;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::crypto::falcon::{self, PublicKey, SecretKey};
use crate::crypto::keys;

#[derive(Debug, thiserror::Error)]
pub enum WalletFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Encryption error")]
    Encryption,
    #[error("Decryption error")]
    Decryption,
    #[error("Invalid password")]
    InvalidPassword,
    #[error("Wallet file not found")]
    NotFound,
    #[error("Wallet file corrupted")]
    Corrupted,
}

#[derive(Serialize, Deserialize)]
pub struct WalletFile {
    pub version: u32,
    pub created: u64,
    pub address: String,
    pub public_key: Vec<u8>,
    pub encrypted_secret_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub salt: String,
}

impl WalletFile {
    /// Creates a new wallet file with a freshly generated Falcon-512 keypair.
    pub fn create_new(password: &str) -> Result<Self, WalletFileError> {
        let (pk, sk) = falcon::generate_keypair();
        let address = keys::encode_address_string(&keys::derive_address(&pk));

        // Generate salt for password hashing
        let salt = SaltString::generate(&mut rand::thread_rng());

        // Derive encryption key from password using Argon2
        let argon2 = Argon2::default();
        let password_hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|_| WalletFileError::Encryption)?;

        // Extract key material (first 32 bytes of hash)
        let key_material = password_hash.hash.ok_or(WalletFileError::Encryption)?;
        let key_bytes = key_material.as_bytes();
        if key_bytes.len() < 32 {
            return Err(WalletFileError::Encryption);
        }

        // Create AES-256-GCM cipher
        let cipher = Aes256Gcm::new_from_slice(&key_bytes[..32])
            .map_err(|_| WalletFileError::Encryption)?;

        // Generate random nonce
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        // Encrypt secret key
        let encrypted_secret_key = cipher
            .encrypt(nonce, sk.0.as_ref())
            .map_err(|_| WalletFileError::Encryption)?;

        Ok(WalletFile {
            version: 1,
            created: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs(),
            address,
            public_key: pk.0,
            encrypted_secret_key,
            nonce: nonce_bytes.to_vec(),
            salt: salt.to_string(),
        })
    }

    /// Decrypts the secret key using the password
    pub fn decrypt_secret_key(&self, password: &str) -> Result<SecretKey, WalletFileError> {
        // Parse salt
        let salt = SaltString::from_b64(&self.salt).map_err(|_| WalletFileError::Corrupted)?;

        // Derive key from password
        let argon2 = Argon2::default();
        let password_hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|_| WalletFileError::InvalidPassword)?;

        // Extract key material
        let key_material = password_hash.hash.ok_or(WalletFileError::Decryption)?;
        let key_bytes = key_material.as_bytes();
        if key_bytes.len() < 32 {
            return Err(WalletFileError::Decryption);
        }

        // Create cipher
        let cipher = Aes256Gcm::new_from_slice(&key_bytes[..32])
            .map_err(|_| WalletFileError::Decryption)?;

        // Decrypt
        let nonce = Nonce::from_slice(&self.nonce);
        let decrypted = cipher
            .decrypt(nonce, self.encrypted_secret_key.as_ref())
            .map_err(|_| WalletFileError::InvalidPassword)?;

        Ok(SecretKey(decrypted))
    }

    /// Saves the wallet file to disk
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WalletFileError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Loads a wallet file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WalletFileError> {
        if !path.as_ref().exists() {
            return Err(WalletFileError::NotFound);
        }
        let json = fs::read_to_string(path)?;
        let wallet: WalletFile = serde_json::from_str(&json)?;
        Ok(wallet)
    }

    /// Gets the public key
    pub fn get_public_key(&self) -> Result<PublicKey, WalletFileError> {
        if self.public_key.is_empty() {
            return Err(WalletFileError::Corrupted);
        }
        Ok(PublicKey(self.public_key.clone()))
    }
}
