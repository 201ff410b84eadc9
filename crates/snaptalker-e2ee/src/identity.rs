use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::keychain::{identity_key_name, Keychain, VAULT_IDENTITY};
use crate::rng::random_bytes;

/// A user's long-term identity key pair.
///
/// Ed25519 so it can sign prekeys; the same scalar is mapped to X25519 for the
/// Diffie-Hellman legs of the handshake. The public half is what peers see as
/// the identity key.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Result<Self, CryptoError> {
        let seed = Zeroizing::new(random_bytes::<32>()?);
        Ok(Self::from_secret_bytes(&seed))
    }

    /// Restore an identity from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The public key as raw bytes (32 bytes). This is the identity key
    /// published in bundles and fed to safety numbers.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the secret key bytes (for the keychain and encrypted backups).
    ///
    /// # Security
    /// Handle with care — this is the private key material.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a signature made by the identity whose public key bytes are given.
    pub fn verify(
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let key_bytes: [u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidBundle("identity key wrong length".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidBundle(format!("invalid identity key: {e}")))?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::InvalidBundle(format!("malformed signature: {e}")))?;
        verifying_key
            .verify(message, &signature)
            .map_err(|e| CryptoError::InvalidBundle(format!("signature mismatch: {e}")))
    }

    /// X25519 static secret for Diffie-Hellman.
    ///
    /// Uses the SHA-512-expanded scalar (same scalar that Ed25519 uses internally)
    /// so that `to_x25519_public()` matches `peer_ed25519_to_x25519()` via the
    /// standard Edwards→Montgomery birational map.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        let scalar_bytes = self.signing_key.to_scalar_bytes();
        x25519_dalek::StaticSecret::from(scalar_bytes)
    }

    pub fn to_x25519_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.to_x25519_secret())
    }

    /// Get the public key as a hex string (for logs and display).
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Convert a peer's Ed25519 identity key bytes to an X25519 public key.
    ///
    /// Uses the standard Edwards→Montgomery birational map (RFC 7748).
    pub fn peer_ed25519_to_x25519(
        ed25519_public_bytes: &[u8],
    ) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let bytes: [u8; 32] = ed25519_public_bytes
            .try_into()
            .map_err(|_| CryptoError::HandshakeFailure("identity key wrong length".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&bytes).map_err(|e| {
            CryptoError::HandshakeFailure(format!("invalid Ed25519 public key: {e}"))
        })?;
        let montgomery = verifying_key.to_montgomery();
        Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Owns the account identity inside the host keychain.
pub struct IdentityKeyStore {
    keychain: Arc<dyn Keychain>,
}

impl IdentityKeyStore {
    pub fn new(keychain: Arc<dyn Keychain>) -> Self {
        Self { keychain }
    }

    /// Return the stored identity for `user_id`, generating and persisting one
    /// on first use.
    ///
    /// The boolean is `true` when the identity was freshly created, in which
    /// case the caller still has to generate and publish prekeys.
    pub fn ensure_identity(&self, user_id: &str) -> Result<(Identity, bool), CryptoError> {
        if let Some(identity) = self.load_identity(user_id)? {
            return Ok((identity, false));
        }

        let identity = Identity::generate()?;
        self.store_identity(user_id, &identity)?;
        tracing::info!(user = %user_id, public_key = %identity.public_key_hex(), "generated new identity key");
        Ok((identity, true))
    }

    pub fn load_identity(&self, user_id: &str) -> Result<Option<Identity>, CryptoError> {
        let Some(bytes) = self
            .keychain
            .load_key(VAULT_IDENTITY, &identity_key_name(user_id))?
        else {
            return Ok(None);
        };
        let bytes = Zeroizing::new(bytes);
        let secret: &[u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::StorageError("stored identity key wrong length".into()))?;
        Ok(Some(Identity::from_secret_bytes(secret)))
    }

    pub fn store_identity(&self, user_id: &str, identity: &Identity) -> Result<(), CryptoError> {
        self.keychain.store_key(
            VAULT_IDENTITY,
            &identity_key_name(user_id),
            identity.secret_key_bytes(),
        )
    }

    /// Destroy the identity (key reset / account deletion).
    pub fn delete_identity(&self, user_id: &str) -> Result<(), CryptoError> {
        self.keychain
            .delete_key(VAULT_IDENTITY, &identity_key_name(user_id))
    }
}
