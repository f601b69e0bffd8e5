//! Encrypted share-link containers
//!
//! A share-link container lets someone with no access to the sender's
//! credential pool fetch one or more stored files. It carries the full chunk
//! list of every file together with the credential token that uploaded each
//! chunk.
//!
//! ## Wire layout
//!
//! ```text
//! salt (16 B) ‖ iv (16 B) ‖ AES-256-CBC(PKCS#7, JSON manifest)
//! ```
//!
//! There are no length prefixes. The key is
//! PBKDF2-HMAC-SHA-256(passphrase, salt, 10 000 iterations, 32 bytes); these
//! numbers are shared with the desktop implementation and must not change.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use msgvault_crypto::share_link::{ShareLinkCodec, ShareManifest, CompatProfile};
//!
//! let codec = ShareLinkCodec::new(CompatProfile::V2);
//! let container = codec.encode(&ShareManifest::single(file), "passphrase")?;
//! let manifest = codec.decode(&container, "passphrase")?;
//! ```

use crate::{
    keys::{generate_iv, KdfProfile, IV_SIZE},
    symmetric, CryptoError, Result,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Salt length of a share-link container
pub const SALT_LEN: usize = 16;

/// Bytes preceding the ciphertext
pub const HEADER_LEN: usize = SALT_LEN + IV_SIZE;

/// Manifest schema revision a build understands, selected once at integration time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatProfile {
    /// Single-file containers only
    V1,
    /// Single and batch containers
    #[default]
    V2,
}

impl CompatProfile {
    /// Manifest `version` field written by this profile
    pub fn manifest_version(&self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Whether batch containers can be produced
    pub fn supports_batch(&self) -> bool {
        matches!(self, Self::V2)
    }
}

impl fmt::Display for CompatProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.manifest_version())
    }
}

/// One chunk of a shared file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedChunk {
    /// 0-based chunk index
    pub index: u32,
    /// Remote message holding the chunk
    pub message_id: String,
    /// Identifier of the credential that uploaded the chunk
    pub uploader_id: String,
    /// Token of that credential; retrieval is scoped to it
    pub uploader_token: String,
    /// Chunk length in bytes
    pub size: u64,
    /// BLAKE3 hex checksum of the chunk bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// One file inside a share-link manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFile {
    /// Original file name
    pub file_name: String,
    /// Total size in bytes
    pub file_size: u64,
    /// MIME type
    pub mime_type: String,
    /// Whether the file is split into chunks
    pub is_chunked: bool,
    /// Remote message of a directly stored file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Credential id of a directly stored file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader_id: Option<String>,
    /// Credential token of a directly stored file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader_token: Option<String>,
    /// Nominal chunk size of a chunked file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    /// Ordered chunk list of a chunked file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<SharedChunk>>,
    /// BLAKE3 hex checksum of the complete file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Creation time, milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl SharedFile {
    /// Number of chunks, zero for directly stored files
    pub fn chunk_count(&self) -> usize {
        self.chunks.as_ref().map_or(0, Vec::len)
    }

    fn validate(&self) -> Result<()> {
        if self.is_chunked {
            let chunks = self.chunks.as_ref().ok_or_else(|| {
                CryptoError::InvalidFormat(format!("{}: chunked file without chunk list", self.file_name))
            })?;
            for (position, chunk) in chunks.iter().enumerate() {
                if chunk.index as usize != position {
                    return Err(CryptoError::InvalidFormat(format!(
                        "{}: chunk at position {} has index {}",
                        self.file_name, position, chunk.index
                    )));
                }
            }
            let total: u64 = chunks.iter().map(|c| c.size).sum();
            if total != self.file_size {
                return Err(CryptoError::InvalidFormat(format!(
                    "{}: chunk sizes sum to {} but file size is {}",
                    self.file_name, total, self.file_size
                )));
            }
        } else if self.file_size > 0 && (self.message_id.is_none() || self.uploader_token.is_none()) {
            return Err(CryptoError::InvalidFormat(format!(
                "{}: direct file without message reference",
                self.file_name
            )));
        }
        Ok(())
    }
}

/// Container type and its file records
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SharePayload {
    /// Exactly one file
    Single { file: SharedFile },
    /// Several files
    Batch { files: Vec<SharedFile> },
}

/// Decrypted plaintext of a share-link container
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareManifest {
    /// Schema version
    pub version: u32,
    /// Single or batch payload
    #[serde(flatten)]
    pub payload: SharePayload,
}

impl ShareManifest {
    /// Manifest for one file
    pub fn single(file: SharedFile) -> Self {
        Self {
            version: CompatProfile::V2.manifest_version(),
            payload: SharePayload::Single { file },
        }
    }

    /// Manifest for several files
    pub fn batch(files: Vec<SharedFile>) -> Self {
        Self {
            version: CompatProfile::V2.manifest_version(),
            payload: SharePayload::Batch { files },
        }
    }

    /// Whether this is a batch container
    pub fn is_batch(&self) -> bool {
        matches!(self.payload, SharePayload::Batch { .. })
    }

    /// All file records in container order
    pub fn files(&self) -> &[SharedFile] {
        match &self.payload {
            SharePayload::Single { file } => std::slice::from_ref(file),
            SharePayload::Batch { files } => files,
        }
    }

    /// Consume into the file records
    pub fn into_files(self) -> Vec<SharedFile> {
        match self.payload {
            SharePayload::Single { file } => vec![file],
            SharePayload::Batch { files } => files,
        }
    }

    fn validate(&self) -> Result<()> {
        match self.version {
            1 if self.is_batch() => {
                return Err(CryptoError::InvalidFormat(
                    "version 1 manifests cannot be batches".to_string(),
                ))
            }
            1 | 2 => {}
            other => return Err(CryptoError::UnsupportedVersion(other)),
        }
        self.files().iter().try_for_each(SharedFile::validate)
    }
}

/// Encrypts and decrypts share-link containers
#[derive(Clone, Copy, Debug, Default)]
pub struct ShareLinkCodec {
    profile: CompatProfile,
}

impl ShareLinkCodec {
    /// Create a codec writing manifests for `profile`
    pub fn new(profile: CompatProfile) -> Self {
        Self { profile }
    }

    /// The profile this codec writes
    pub fn profile(&self) -> CompatProfile {
        self.profile
    }

    /// Encrypt with a fresh random salt and IV
    pub fn encode(&self, manifest: &ShareManifest, passphrase: &str) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&KdfProfile::SHARE_LINK.generate_salt());
        self.encode_with(manifest, passphrase, &salt, &generate_iv())
    }

    /// Encrypt with caller-chosen salt and IV
    pub fn encode_with(
        &self,
        manifest: &ShareManifest,
        passphrase: &str,
        salt: &[u8; SALT_LEN],
        iv: &[u8; IV_SIZE],
    ) -> Result<Vec<u8>> {
        if manifest.is_batch() && !self.profile.supports_batch() {
            return Err(CryptoError::ProfileMismatch {
                profile: self.profile.to_string(),
                what: "batch containers".to_string(),
            });
        }
        let mut manifest = manifest.clone();
        manifest.version = self.profile.manifest_version();
        manifest.validate()?;

        let json = serde_json::to_vec(&manifest)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        let key = KdfProfile::SHARE_LINK.derive(passphrase, salt)?;
        let ciphertext = symmetric::encrypt(&key, iv, &json)?;

        let mut container = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        container.extend_from_slice(salt);
        container.extend_from_slice(iv);
        container.extend_from_slice(&ciphertext);
        Ok(container)
    }

    /// Decrypt and parse a container.
    ///
    /// Anything that fails before a well-formed manifest is recovered maps to
    /// [`CryptoError::WrongPasswordOrCorrupt`]; a wrong key can occasionally
    /// produce valid padding, so JSON failure is treated the same way.
    pub fn decode(&self, container: &[u8], passphrase: &str) -> Result<ShareManifest> {
        if container.len() <= HEADER_LEN {
            return Err(CryptoError::WrongPasswordOrCorrupt);
        }
        let (salt, rest) = container.split_at(SALT_LEN);
        let (iv, ciphertext) = rest.split_at(IV_SIZE);
        let mut iv_arr = [0u8; IV_SIZE];
        iv_arr.copy_from_slice(iv);

        let key = KdfProfile::SHARE_LINK.derive(passphrase, salt)?;
        let plaintext = symmetric::decrypt(&key, &iv_arr, ciphertext)?;
        let manifest: ShareManifest =
            serde_json::from_slice(&plaintext).map_err(|_| CryptoError::WrongPasswordOrCorrupt)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

/// Text form of a container, safe to paste into a message or URL
pub fn armor(container: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(container)
}

/// Inverse of [`armor`]; surrounding whitespace is ignored
pub fn dearmor(text: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(text.trim())
        .map_err(|e| CryptoError::InvalidFormat(format!("armored container: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn chunk(index: u32, size: u64) -> SharedChunk {
        SharedChunk {
            index,
            message_id: format!("msg-{}", index),
            uploader_id: format!("cred-{}", index % 3),
            uploader_token: format!("token-{}", index % 3),
            size,
            checksum: None,
        }
    }

    fn chunked_file() -> SharedFile {
        SharedFile {
            file_name: "movie.mkv".to_string(),
            file_size: 10,
            mime_type: "video/x-matroska".to_string(),
            is_chunked: true,
            message_id: None,
            uploader_id: None,
            uploader_token: None,
            chunk_size: Some(4),
            chunks: Some(vec![chunk(0, 4), chunk(1, 4), chunk(2, 2)]),
            checksum: None,
            created_at: Some(1_700_000_000_000),
        }
    }

    fn direct_file() -> SharedFile {
        SharedFile {
            file_name: "notes.txt".to_string(),
            file_size: 5,
            mime_type: "text/plain".to_string(),
            is_chunked: false,
            message_id: Some("msg-99".to_string()),
            uploader_id: Some("cred-0".to_string()),
            uploader_token: Some("token-0".to_string()),
            chunk_size: None,
            chunks: None,
            checksum: None,
            created_at: None,
        }
    }

    #[test]
    fn test_container_layout() {
        let codec = ShareLinkCodec::default();
        let salt = [1u8; SALT_LEN];
        let iv = [2u8; IV_SIZE];
        let container = codec
            .encode_with(&ShareManifest::single(direct_file()), "pw", &salt, &iv)
            .unwrap();
        assert_eq!(&container[..SALT_LEN], &salt);
        assert_eq!(&container[SALT_LEN..HEADER_LEN], &iv);
        assert_eq!((container.len() - HEADER_LEN) % 16, 0);
    }

    #[test]
    fn test_encode_with_is_deterministic() {
        let codec = ShareLinkCodec::default();
        let manifest = ShareManifest::single(chunked_file());
        let a = codec.encode_with(&manifest, "pw", &[5; 16], &[6; 16]).unwrap();
        let b = codec.encode_with(&manifest, "pw", &[5; 16], &[6; 16]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_batch_roundtrip_keeps_chunk_lists() {
        let codec = ShareLinkCodec::default();
        let manifest = ShareManifest::batch(vec![chunked_file(), direct_file()]);
        let container = codec.encode(&manifest, "correct horse").unwrap();
        let decoded = codec.decode(&container, "correct horse").unwrap();

        assert!(decoded.is_batch());
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.files()[0].chunk_count(), 3);
        assert!(decoded.files()[1].chunks.is_none());
    }

    #[rstest]
    #[case("wrong")]
    #[case("")]
    #[case("correct horsE")]
    fn test_wrong_passphrase_never_decodes(#[case] attempt: &str) {
        let codec = ShareLinkCodec::default();
        let container = codec
            .encode(&ShareManifest::single(chunked_file()), "correct horse")
            .unwrap();
        assert!(matches!(
            codec.decode(&container, attempt),
            Err(CryptoError::WrongPasswordOrCorrupt)
        ));
    }

    #[rstest]
    #[case(0)]
    #[case(HEADER_LEN)]
    #[case(HEADER_LEN + 7)]
    fn test_truncated_container(#[case] len: usize) {
        let codec = ShareLinkCodec::default();
        let container = codec
            .encode(&ShareManifest::single(direct_file()), "pw")
            .unwrap();
        assert!(matches!(
            codec.decode(&container[..len], "pw"),
            Err(CryptoError::WrongPasswordOrCorrupt)
        ));
    }

    #[test]
    fn test_v1_profile_refuses_batch() {
        let codec = ShareLinkCodec::new(CompatProfile::V1);
        let result = codec.encode(&ShareManifest::batch(vec![direct_file()]), "pw");
        assert!(matches!(result, Err(CryptoError::ProfileMismatch { .. })));

        let container = codec
            .encode(&ShareManifest::single(direct_file()), "pw")
            .unwrap();
        let decoded = ShareLinkCodec::default().decode(&container, "pw").unwrap();
        assert_eq!(decoded.version, 1);
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(ShareManifest::single(direct_file())).unwrap();
        assert_eq!(json["type"], "single");
        assert_eq!(json["version"], 2);
        assert_eq!(json["file"]["fileName"], "notes.txt");
        assert_eq!(json["file"]["isChunked"], false);
        assert!(json["file"].get("chunks").is_none());
    }

    #[test]
    fn test_gap_in_chunk_list_rejected() {
        let mut file = chunked_file();
        file.chunks.as_mut().unwrap().remove(1);
        let result = ShareLinkCodec::default().encode(&ShareManifest::single(file), "pw");
        assert!(matches!(result, Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn test_armored_container_decodes() {
        let codec = ShareLinkCodec::default();
        let container = codec.encode(&ShareManifest::single(chunked_file()), "pw").unwrap();
        let text = armor(&container);
        assert!(!text.contains(['+', '/', '=']));
        let restored = dearmor(&format!("{}\n", text)).unwrap();
        assert_eq!(restored, container);
        assert!(codec.decode(&restored, "pw").is_ok());
        assert!(matches!(dearmor("not*base64"), Err(CryptoError::InvalidFormat(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_roundtrip_any_name(name in "\\PC{0,40}", size in 0u64..1_000_000) {
            let mut file = direct_file();
            file.file_name = name;
            file.file_size = size;
            let manifest = ShareManifest::single(file);
            let codec = ShareLinkCodec::default();
            let container = codec.encode(&manifest, "pw").unwrap();
            prop_assert_eq!(codec.decode(&container, "pw").unwrap(), manifest);
        }
    }
}
