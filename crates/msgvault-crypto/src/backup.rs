//! Backup archive container
//!
//! Whole-database exports are sealed with their own parameters so that a
//! backup passphrase can never open a share link or the other way round:
//!
//! ```text
//! "MVBACKUP" ‖ version (1 B) ‖ salt (32 B) ‖ iv (16 B) ‖ AES-256-CBC(archive)
//! ```
//!
//! The key is PBKDF2-HMAC-SHA-256 with 100 000 iterations. An archive with an
//! unknown version is rejected; there is no attempt to read it as raw data.

use crate::{
    keys::{generate_iv, KdfProfile, IV_SIZE},
    symmetric, CryptoError, Result,
};

/// File magic
pub const MAGIC: &[u8; 8] = b"MVBACKUP";

/// Current archive version
pub const VERSION: u8 = 1;

const SALT_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + IV_SIZE;

/// Encrypt an archive payload
pub fn seal(archive: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let profile = KdfProfile::BACKUP_ARCHIVE;
    let salt = profile.generate_salt();
    let iv = generate_iv();
    let key = profile.derive(passphrase, &salt)?;
    let ciphertext = symmetric::encrypt(&key, &iv, archive)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an archive produced by [`seal`]
pub fn open(sealed: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    if sealed.len() < MAGIC.len() || &sealed[..MAGIC.len()] != MAGIC {
        return Err(CryptoError::InvalidFormat("not a backup archive".to_string()));
    }
    let version = sealed.get(MAGIC.len()).copied().unwrap_or_default();
    if version != VERSION {
        return Err(CryptoError::UnsupportedVersion(u32::from(version)));
    }
    if sealed.len() <= HEADER_LEN {
        return Err(CryptoError::WrongPasswordOrCorrupt);
    }

    let salt_start = MAGIC.len() + 1;
    let salt = &sealed[salt_start..salt_start + SALT_LEN];
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&sealed[salt_start + SALT_LEN..HEADER_LEN]);

    let key = KdfProfile::BACKUP_ARCHIVE.derive(passphrase, salt)?;
    symmetric::decrypt(&key, &iv, &sealed[HEADER_LEN..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share_link::{ShareLinkCodec, ShareManifest, SharedFile};

    #[test]
    fn test_backup_roundtrip() {
        let sealed = seal(b"{\"files\":[]}", "backup pw").unwrap();
        assert_eq!(&sealed[..8], MAGIC);
        assert_eq!(sealed[8], VERSION);
        assert_eq!(open(&sealed, "backup pw").unwrap(), b"{\"files\":[]}");
    }

    #[test]
    fn test_unknown_version_is_reported() {
        let mut sealed = seal(b"data", "pw").unwrap();
        sealed[8] = 9;
        assert!(matches!(open(&sealed, "pw"), Err(CryptoError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_not_an_archive() {
        assert!(matches!(open(b"SQLite format 3", "pw"), Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn test_share_link_is_not_a_backup() {
        let file = SharedFile {
            file_name: "a".to_string(),
            file_size: 0,
            mime_type: "text/plain".to_string(),
            is_chunked: false,
            message_id: None,
            uploader_id: None,
            uploader_token: None,
            chunk_size: None,
            chunks: None,
            checksum: None,
            created_at: None,
        };
        let container = ShareLinkCodec::default()
            .encode(&ShareManifest::single(file), "pw")
            .unwrap();
        assert!(open(&container, "pw").is_err());
    }
}
