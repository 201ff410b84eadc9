//! Passphrase-encrypted export of key material.
//!
//! The passphrase is stretched with PBKDF2-HMAC-SHA256 over a random 32-byte
//! salt, and the JSON payload is sealed with AES-256-GCM. Key derivation is
//! deliberately slow; async callers should run these functions on a blocking
//! thread.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::cipher::{open, seal};
use crate::error::CryptoError;
use crate::prekeys::SignedPreKey;
use crate::rng::random_bytes;
use crate::session::SessionRecord;

pub const BACKUP_VERSION: &str = "1.0";
pub const MIN_BACKUP_ITERATIONS: u32 = 100_000;
/// Upper bound on PBKDF2 rounds; a blob asking for more is refused before any
/// key derivation runs.
pub const MAX_BACKUP_ITERATIONS: u32 = 10_000_000;
const SALT_LEN: usize = 32;

fn default_iterations() -> u32 {
    MIN_BACKUP_ITERATIONS
}

/// The exported artifact. Every field is safe to store anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupBlob {
    pub ciphertext: String,
    pub iv: String,
    pub salt: String,
    pub version: String,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

impl BackupBlob {
    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Zeroize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPreKey {
    pub id: u32,
    pub private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Zeroize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSession {
    #[zeroize(skip)]
    pub record: SessionRecord,
    /// Root and chain key, base64. `None` for a session awaiting a handshake.
    pub keys: Option<String>,
}

/// Plaintext backup payload. Wiped on drop.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct BackupContents {
    pub user_id: String,
    pub identity_key: String,
    #[zeroize(skip)]
    pub signed_pre_key: Option<SignedPreKey>,
    pub one_time_pre_keys: Vec<BackupPreKey>,
    /// Next id the prekey counter hands out, so restored pools never reuse one.
    #[serde(default)]
    pub next_one_time_id: u32,
    pub sessions: Vec<BackupSession>,
    pub created_at: u64,
}

impl std::fmt::Debug for BackupContents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupContents")
            .field("user_id", &self.user_id)
            .field("one_time_pre_keys", &self.one_time_pre_keys.len())
            .field("sessions", &self.sessions.len())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key[..]);
    key
}

pub fn encrypt_backup(
    contents: &BackupContents,
    passphrase: &str,
    iterations: u32,
) -> Result<BackupBlob, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::Backup("passphrase must not be empty".into()));
    }
    if !(MIN_BACKUP_ITERATIONS..=MAX_BACKUP_ITERATIONS).contains(&iterations) {
        return Err(CryptoError::Backup(format!(
            "iterations must be between {MIN_BACKUP_ITERATIONS} and {MAX_BACKUP_ITERATIONS}"
        )));
    }

    let salt = random_bytes::<SALT_LEN>()?;
    let key = derive_key(passphrase, &salt, iterations);
    let plaintext = Zeroizing::new(serde_json::to_vec(contents)?);
    let (ciphertext, iv) = seal(&key, &plaintext, BACKUP_VERSION.as_bytes())?;

    Ok(BackupBlob {
        ciphertext: BASE64.encode(ciphertext),
        iv: BASE64.encode(iv),
        salt: BASE64.encode(salt),
        version: BACKUP_VERSION.to_string(),
        iterations,
    })
}

/// A wrong passphrase surfaces as `DecryptionFailed`.
pub fn decrypt_backup(blob: &BackupBlob, passphrase: &str) -> Result<BackupContents, CryptoError> {
    if blob.version != BACKUP_VERSION {
        return Err(CryptoError::Backup(format!(
            "unsupported backup version {}",
            blob.version
        )));
    }
    if !(MIN_BACKUP_ITERATIONS..=MAX_BACKUP_ITERATIONS).contains(&blob.iterations) {
        return Err(CryptoError::Backup(format!(
            "backup uses {} iterations, outside the accepted range",
            blob.iterations
        )));
    }

    let decode = |what: &str, value: &str| {
        BASE64
            .decode(value)
            .map_err(|e| CryptoError::Backup(format!("{what} encoding: {e}")))
    };
    let salt = decode("salt", &blob.salt)?;
    let iv = decode("iv", &blob.iv)?;
    let ciphertext = decode("ciphertext", &blob.ciphertext)?;
    if salt.len() != SALT_LEN {
        return Err(CryptoError::Backup(format!("salt must be {SALT_LEN} bytes")));
    }

    let key = derive_key(passphrase, &salt, blob.iterations);
    let plaintext = Zeroizing::new(open(&key, &iv, &ciphertext, blob.version.as_bytes())?);
    serde_json::from_slice(&plaintext)
        .map_err(|e| CryptoError::Backup(format!("backup payload: {e}")))
}
