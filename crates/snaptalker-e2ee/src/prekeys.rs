//! Signed and one-time prekey generation.
//!
//! Private halves go straight into the keychain; only the public, base64
//! encoded [`PublishedKeyBundle`] leaves this module.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::identity::Identity;
use crate::keychain::{
    one_time_prekey_name, Keychain, KEY_NEXT_PREKEY_ID, KEY_SIGNED_PREKEY, VAULT_PREKEYS,
};
use crate::rng::random_bytes;

/// Size of the one-time prekey pool generated at registration.
pub const DEFAULT_ONE_TIME_PREKEY_COUNT: u32 = 100;

const ONE_TIME_PREFIX: &str = "one_time:";

/// Medium-lived X25519 prekey whose public half is signed by the identity key.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SignedPreKey {
    pub id: u32,
    pub public_key: [u8; 32],
    private_key: [u8; 32],
    pub signature: Vec<u8>,
    pub created_at: u64,
}

impl SignedPreKey {
    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.private_key)
    }
}

impl std::fmt::Debug for SignedPreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedPreKey")
            .field("id", &self.id)
            .field("public_key", &hex::encode(self.public_key))
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Single-use X25519 prekey.
#[derive(Clone, ZeroizeOnDrop)]
pub struct OneTimePreKey {
    pub id: u32,
    pub public_key: [u8; 32],
    private_key: [u8; 32],
}

impl OneTimePreKey {
    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.private_key)
    }

    fn from_private(id: u32, private_key: [u8; 32]) -> Self {
        let public_key = X25519Public::from(&StaticSecret::from(private_key)).to_bytes();
        Self {
            id,
            public_key,
            private_key,
        }
    }
}

/// Public prekey entry in a published bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedPreKey {
    pub id: u32,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedSignedPreKey {
    pub id: u32,
    pub public_key: String,
    pub signature: String,
}

/// Payload handed to the transport for publication. Public material only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedKeyBundle {
    pub identity_key: String,
    pub signed_pre_key: PublishedSignedPreKey,
    pub one_time_pre_keys: Vec<PublishedPreKey>,
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn generate_x25519() -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let private_key = random_bytes::<32>()?;
    let public_key = X25519Public::from(&StaticSecret::from(private_key)).to_bytes();
    Ok((private_key, public_key))
}

/// Generates prekeys from an identity and keeps their private halves in the
/// keychain.
pub struct PreKeyFactory {
    keychain: Arc<dyn Keychain>,
}

impl PreKeyFactory {
    pub fn new(keychain: Arc<dyn Keychain>) -> Self {
        Self { keychain }
    }

    /// Generate one signed prekey and `one_time_count` one-time prekeys.
    ///
    /// Fails with `CryptoUnavailable` if the random source does, before
    /// anything is written.
    pub fn generate_key_bundle(
        &self,
        identity: &Identity,
        one_time_count: u32,
    ) -> Result<PublishedKeyBundle, CryptoError> {
        let signed = self.rotate_signed_prekey(identity)?;
        let one_time_pre_keys = self.generate_one_time_prekeys(one_time_count)?;

        tracing::info!(
            signed_prekey_id = signed.id,
            one_time = one_time_pre_keys.len(),
            "generated key bundle"
        );

        Ok(PublishedKeyBundle {
            identity_key: BASE64.encode(identity.public_key_bytes()),
            signed_pre_key: PublishedSignedPreKey {
                id: signed.id,
                public_key: BASE64.encode(signed.public_key),
                signature: BASE64.encode(&signed.signature),
            },
            one_time_pre_keys,
        })
    }

    /// Replace the current signed prekey with a fresh one.
    pub fn rotate_signed_prekey(&self, identity: &Identity) -> Result<SignedPreKey, CryptoError> {
        let id = self.current_signed_prekey()?.map_or(1, |spk| spk.id.wrapping_add(1));
        let (private_key, public_key) = generate_x25519()?;
        let signature = identity.sign(&public_key).to_bytes().to_vec();

        let signed = SignedPreKey {
            id,
            public_key,
            private_key,
            signature,
            created_at: unix_millis(),
        };
        let record = Zeroizing::new(serde_json::to_vec(&signed)?);
        self.keychain
            .store_key(VAULT_PREKEYS, KEY_SIGNED_PREKEY, &record)?;
        Ok(signed)
    }

    /// Generate more one-time prekeys, continuing the id sequence so a
    /// replenished batch never reuses an id.
    pub fn generate_one_time_prekeys(
        &self,
        count: u32,
    ) -> Result<Vec<PublishedPreKey>, CryptoError> {
        let first_id = self.next_one_time_id()?;

        let mut generated = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let (private_key, public_key) = generate_x25519()?;
            generated.push((first_id + offset, Zeroizing::new(private_key), public_key));
        }

        for (id, private_key, _) in &generated {
            self.keychain
                .store_key(VAULT_PREKEYS, &one_time_prekey_name(*id), private_key.as_slice())?;
        }
        self.keychain.store_key(
            VAULT_PREKEYS,
            KEY_NEXT_PREKEY_ID,
            &(first_id + count).to_le_bytes(),
        )?;

        Ok(generated
            .into_iter()
            .map(|(id, _, public_key)| PublishedPreKey {
                id,
                public_key: BASE64.encode(public_key),
            })
            .collect())
    }

    pub fn current_signed_prekey(&self) -> Result<Option<SignedPreKey>, CryptoError> {
        self.keychain
            .load_key(VAULT_PREKEYS, KEY_SIGNED_PREKEY)?
            .map(|bytes| {
                let bytes = Zeroizing::new(bytes);
                serde_json::from_slice::<SignedPreKey>(&bytes).map_err(CryptoError::from)
            })
            .transpose()
    }

    /// Load the signed prekey a peer's handshake refers to.
    pub fn load_signed_prekey(&self, id: u32) -> Result<SignedPreKey, CryptoError> {
        match self.current_signed_prekey()? {
            Some(spk) if spk.id == id => Ok(spk),
            Some(spk) => Err(CryptoError::HandshakeFailure(format!(
                "signed prekey {id} is not current (current is {})",
                spk.id
            ))),
            None => Err(CryptoError::HandshakeFailure("no signed prekey".into())),
        }
    }

    /// Load a one-time prekey and delete it, so it can only serve one
    /// handshake. `None` if it was already consumed.
    pub fn take_one_time_prekey(&self, id: u32) -> Result<Option<OneTimePreKey>, CryptoError> {
        let prekey = self.load_one_time_prekey(id)?;
        if prekey.is_some() {
            self.keychain
                .delete_key(VAULT_PREKEYS, &one_time_prekey_name(id))?;
        }
        Ok(prekey)
    }

    /// Load a one-time prekey without consuming it.
    pub fn load_one_time_prekey(&self, id: u32) -> Result<Option<OneTimePreKey>, CryptoError> {
        let Some(bytes) = self
            .keychain
            .load_key(VAULT_PREKEYS, &one_time_prekey_name(id))?
        else {
            return Ok(None);
        };
        let bytes = Zeroizing::new(bytes);
        let private_key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::StorageError("stored one-time prekey wrong length".into()))?;
        Ok(Some(OneTimePreKey::from_private(id, private_key)))
    }

    /// Number of unconsumed one-time prekeys left in the local pool.
    pub fn remaining_one_time_prekeys(&self) -> Result<usize, CryptoError> {
        Ok(self
            .keychain
            .list_keys(VAULT_PREKEYS)?
            .iter()
            .filter(|k| k.starts_with(ONE_TIME_PREFIX))
            .count())
    }

    /// Rebuild the publishable bundle from what the keychain currently holds.
    /// `None` before the first signed prekey exists.
    pub fn local_bundle(&self, identity: &Identity) -> Result<Option<PublishedKeyBundle>, CryptoError> {
        let Some(signed) = self.current_signed_prekey()? else {
            return Ok(None);
        };
        let mut one_time_pre_keys = Vec::new();
        for (id, _) in self.export_one_time_prekeys()? {
            if let Some(prekey) = self.load_one_time_prekey(id)? {
                one_time_pre_keys.push(PublishedPreKey {
                    id,
                    public_key: BASE64.encode(prekey.public_key),
                });
            }
        }
        Ok(Some(PublishedKeyBundle {
            identity_key: BASE64.encode(identity.public_key_bytes()),
            signed_pre_key: PublishedSignedPreKey {
                id: signed.id,
                public_key: BASE64.encode(signed.public_key),
                signature: BASE64.encode(&signed.signature),
            },
            one_time_pre_keys,
        }))
    }

    /// All stored one-time prekeys, for backups.
    pub(crate) fn export_one_time_prekeys(&self) -> Result<Vec<(u32, Vec<u8>)>, CryptoError> {
        let mut out = Vec::new();
        for name in self.keychain.list_keys(VAULT_PREKEYS)? {
            let Some(id) = name
                .strip_prefix(ONE_TIME_PREFIX)
                .and_then(|id| id.parse::<u32>().ok())
            else {
                continue;
            };
            if let Some(bytes) = self.keychain.load_key(VAULT_PREKEYS, &name)? {
                out.push((id, bytes));
            }
        }
        out.sort_by_key(|(id, _)| *id);
        Ok(out)
    }

    /// Restore prekeys from a backup, replacing the local pool.
    pub(crate) fn import_prekeys(
        &self,
        signed: Option<&SignedPreKey>,
        one_time: &[(u32, Vec<u8>)],
        next_one_time_id: u32,
    ) -> Result<(), CryptoError> {
        self.delete_all()?;
        if let Some(signed) = signed {
            let record = Zeroizing::new(serde_json::to_vec(signed)?);
            self.keychain
                .store_key(VAULT_PREKEYS, KEY_SIGNED_PREKEY, &record)?;
        }
        let mut next_id = next_one_time_id.max(1);
        for (id, private_key) in one_time {
            self.keychain
                .store_key(VAULT_PREKEYS, &one_time_prekey_name(*id), private_key)?;
            next_id = next_id.max(id + 1);
        }
        self.keychain
            .store_key(VAULT_PREKEYS, KEY_NEXT_PREKEY_ID, &u32::to_le_bytes(next_id))
    }

    /// Remove every prekey (key reset).
    pub fn delete_all(&self) -> Result<(), CryptoError> {
        for name in self.keychain.list_keys(VAULT_PREKEYS)? {
            self.keychain.delete_key(VAULT_PREKEYS, &name)?;
        }
        Ok(())
    }

    pub(crate) fn next_one_time_id(&self) -> Result<u32, CryptoError> {
        match self.keychain.load_key(VAULT_PREKEYS, KEY_NEXT_PREKEY_ID)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::StorageError("corrupt prekey counter".into()))?;
                Ok(u32::from_le_bytes(raw))
            }
            None => Ok(1),
        }
    }
}
