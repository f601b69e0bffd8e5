//! AES-256-CBC with PKCS#7 padding
//!
//! Both container formats use unauthenticated CBC because the desktop
//! counterpart does. A wrong key surfaces as a padding failure, which callers
//! report as [`CryptoError::WrongPasswordOrCorrupt`].

use crate::{
    keys::{ContainerKey, IV_SIZE},
    CryptoError, Result,
};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypt `plaintext` under `key` and `iv`
pub fn encrypt(key: &ContainerKey, iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt `ciphertext`; any padding failure means wrong key or damaged data
pub fn decrypt(key: &ContainerKey, iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % IV_SIZE != 0 {
        return Err(CryptoError::WrongPasswordOrCorrupt);
    }
    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::WrongPasswordOrCorrupt)
}
