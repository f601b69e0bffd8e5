//! Error types for the msgvault-crypto crate

use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The passphrase is wrong or the container was damaged.
    ///
    /// CBC padding failure cannot tell the two apart, so they share a variant.
    #[error("wrong password or corrupt container")]
    WrongPasswordOrCorrupt,

    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Container or manifest format is not recognized
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Container or manifest version is not supported by this build
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    /// The selected compatibility profile cannot express this manifest
    #[error("profile {profile} does not support {what}")]
    ProfileMismatch { profile: String, what: String },

    /// Hash verification failed
    #[error("hash verification failed: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Hex decode error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
