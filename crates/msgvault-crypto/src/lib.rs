//! # msgvault Crypto
//!
//! Cryptographic building blocks for msgvault.
//!
//! This crate provides:
//! - **Share links**: AES-256-CBC containers carrying self-contained file manifests
//! - **Backup archives**: a separately parameterised container for database exports
//! - **Key derivation**: fixed PBKDF2-HMAC-SHA-256 profiles shared with the desktop client
//! - **BLAKE3**: chunk and file checksums
//!
//! ## Example
//!
//! ```rust,ignore
//! use msgvault_crypto::{ShareLinkCodec, ShareManifest};
//!
//! let codec = ShareLinkCodec::default();
//! let container = codec.encode(&ShareManifest::batch(files), "passphrase")?;
//! let manifest = codec.decode(&container, "passphrase")?;
//! ```

pub mod backup;
pub mod error;
pub mod hashing;
pub mod keys;
pub mod share_link;
pub mod symmetric;

pub use error::{CryptoError, Result};
pub use hashing::{checksum_hex, verify_checksum, Blake3Hash, IncrementalHasher};
pub use keys::{ContainerKey, KdfProfile};
pub use share_link::{
    armor, dearmor, CompatProfile, ShareLinkCodec, ShareManifest, SharePayload, SharedChunk,
    SharedFile,
};
