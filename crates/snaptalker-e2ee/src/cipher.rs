use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;
use crate::rng::random_bytes;

pub(crate) const IV_LEN: usize = 12;
pub(crate) const TAG_LEN: usize = 16;

/// AES-256-GCM with a fresh random IV. Returns `(ciphertext || tag, iv)`.
pub(crate) fn seal(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; IV_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let iv = random_bytes::<IV_LEN>()?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    Ok((ciphertext, iv))
}

/// Decrypt and authenticate. Any mismatch is `DecryptionFailed`; no partial
/// plaintext is ever returned.
pub(crate) fn open(
    key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != IV_LEN {
        return Err(CryptoError::DecryptionFailed(format!(
            "iv must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailed("ciphertext too short".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed("authentication tag mismatch".into()))
}

/// HKDF-SHA256 to 32 bytes.
pub(crate) fn hkdf32(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::EncryptionError(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
