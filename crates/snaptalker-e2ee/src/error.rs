use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The host has no usable secure random source. Encryption must be
    /// disabled, never replaced by weaker key material.
    #[error("cryptography unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("invalid key bundle: {0}")]
    InvalidBundle(String),

    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("no one-time prekey available for {0}")]
    KeyExhaustion(String),

    #[error("message {id} exceeded {attempts} delivery attempts")]
    QueueOverflow { id: String, attempts: u32 },

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("session error: {0}")]
    SessionError(String),

    #[error("encryption is disabled")]
    Disabled,

    #[error("key storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backup error: {0}")]
    Backup(String),
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
