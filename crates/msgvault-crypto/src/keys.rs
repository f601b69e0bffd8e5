//! Passphrase-derived keys
//!
//! Both container formats derive an AES-256 key from a user passphrase with
//! PBKDF2-HMAC-SHA-256. The parameters are part of the wire contract with the
//! desktop implementation, so each container has its own fixed profile and the
//! two must never be mixed.

use crate::{CryptoError, Result};
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a symmetric key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// AES block size, also the CBC IV size
pub const IV_SIZE: usize = 16;

/// Fixed key-derivation parameters for one container format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfProfile {
    /// Human-readable name used in errors and logs
    pub name: &'static str,
    /// PBKDF2 iteration count
    pub iterations: u32,
    /// Salt length in bytes
    pub salt_len: usize,
}

impl KdfProfile {
    /// Share-link containers: 16-byte salt, 10 000 iterations
    pub const SHARE_LINK: KdfProfile = KdfProfile {
        name: "share-link",
        iterations: 10_000,
        salt_len: 16,
    };

    /// Backup archives: 32-byte salt, 100 000 iterations
    pub const BACKUP_ARCHIVE: KdfProfile = KdfProfile {
        name: "backup-archive",
        iterations: 100_000,
        salt_len: 32,
    };

    /// Generate a random salt of this profile's length
    pub fn generate_salt(&self) -> Vec<u8> {
        let mut salt = vec![0u8; self.salt_len];
        rand::RngCore::fill_bytes(&mut OsRng, &mut salt);
        salt
    }

    /// Derive the container key from a passphrase and salt
    pub fn derive(&self, passphrase: &str, salt: &[u8]) -> Result<ContainerKey> {
        if salt.len() != self.salt_len {
            return Err(CryptoError::InvalidKey(format!(
                "{} salt must be {} bytes, got {}",
                self.name,
                self.salt_len,
                salt.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, self.iterations, &mut key);
        Ok(ContainerKey { key })
    }
}

/// An AES-256 key derived from a passphrase, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ContainerKey {
    key: [u8; KEY_SIZE],
}

impl ContainerKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

/// Generate a random CBC initialization vector
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::RngCore::fill_bytes(&mut OsRng, &mut iv);
    iv
}
