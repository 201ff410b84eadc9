//! Peer key bundles and one-time prekey bookkeeping.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::prekeys::{unix_millis, PublishedKeyBundle, PublishedPreKey};
use crate::storage::{get_json, put_json, AppStorage};

/// Storage key of the persisted bundle cache.
pub const BUNDLE_STORAGE_KEY: &str = "x3dh_key_bundles";

/// How far a bundle timestamp may run ahead of the local clock.
const MAX_FUTURE_SKEW: Duration = Duration::from_secs(5 * 60);

/// A peer's public key bundle, as fetched from the transport.
///
/// Keys are base64 strings exactly as they travel on the wire; decode them
/// with the accessor methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundle {
    pub user_id: String,
    pub identity_key: String,
    pub signed_pre_key: PublishedPreKey,
    pub signed_pre_key_signature: String,
    pub one_time_pre_key: Option<PublishedPreKey>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl KeyBundle {
    /// Build the bundle a server would hand out from a published upload,
    /// attaching at most one of its one-time prekeys.
    pub fn from_published(
        user_id: &str,
        published: &PublishedKeyBundle,
        one_time_pre_key: Option<PublishedPreKey>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            identity_key: published.identity_key.clone(),
            signed_pre_key: PublishedPreKey {
                id: published.signed_pre_key.id,
                public_key: published.signed_pre_key.public_key.clone(),
            },
            signed_pre_key_signature: published.signed_pre_key.signature.clone(),
            one_time_pre_key,
            timestamp: unix_millis(),
        }
    }

    pub fn identity_key_bytes(&self) -> Result<[u8; 32], CryptoError> {
        decode_key("identity key", &self.identity_key)
    }

    pub fn signed_pre_key_bytes(&self) -> Result<[u8; 32], CryptoError> {
        decode_key("signed prekey", &self.signed_pre_key.public_key)
    }

    pub fn one_time_pre_key_bytes(&self) -> Result<Option<(u32, [u8; 32])>, CryptoError> {
        self.one_time_pre_key
            .as_ref()
            .map(|otk| decode_key("one-time prekey", &otk.public_key).map(|k| (otk.id, k)))
            .transpose()
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        BASE64
            .decode(&self.signed_pre_key_signature)
            .map_err(|e| CryptoError::InvalidBundle(format!("signature encoding: {e}")))
    }
}

/// Decode a base64 32-byte public key.
pub(crate) fn decode_key(what: &str, value: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|e| CryptoError::HandshakeFailure(format!("{what} encoding: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::HandshakeFailure(format!("{what} must be 32 bytes, got {}", bytes.len())))
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedBundles {
    bundles: BTreeMap<String, KeyBundle>,
    used_keys: BTreeMap<String, BTreeSet<u32>>,
}

/// Local cache of peer bundles plus the one-time prekey ids we have consumed.
///
/// Used ids are tracked per peer: ids are only unique within one user's
/// pool. A consumed id is never handed out again by
/// [`KeyBundleManager::bundle_for_handshake`].
pub struct KeyBundleManager {
    storage: Arc<dyn AppStorage>,
    bundles: HashMap<String, KeyBundle>,
    used_one_time_prekeys: HashMap<String, BTreeSet<u32>>,
    max_bundle_age: Duration,
}

impl KeyBundleManager {
    pub fn new(storage: Arc<dyn AppStorage>, max_bundle_age: Duration) -> Self {
        Self {
            storage,
            bundles: HashMap::new(),
            used_one_time_prekeys: HashMap::new(),
            max_bundle_age,
        }
    }

    /// Cache a peer's bundle, replacing any previous one.
    ///
    /// Rejects bundles for a different user and bundles whose timestamp is
    /// clearly stale or in the future. Signatures are checked by the handshake.
    pub fn store_bundle(&mut self, user_id: &str, bundle: KeyBundle) -> Result<(), CryptoError> {
        if bundle.user_id != user_id {
            return Err(CryptoError::InvalidBundle(format!(
                "bundle for {} offered as {user_id}",
                bundle.user_id
            )));
        }

        let now = unix_millis();
        let max_age = u64::try_from(self.max_bundle_age.as_millis()).unwrap_or(u64::MAX);
        let skew = u64::try_from(MAX_FUTURE_SKEW.as_millis()).unwrap_or(u64::MAX);
        if now.saturating_sub(bundle.timestamp) > max_age {
            return Err(CryptoError::InvalidBundle(format!(
                "bundle for {user_id} is stale"
            )));
        }
        if bundle.timestamp > now.saturating_add(skew) {
            return Err(CryptoError::InvalidBundle(format!(
                "bundle for {user_id} is dated in the future"
            )));
        }

        self.bundles.insert(user_id.to_string(), bundle);
        Ok(())
    }

    pub fn get_bundle(&self, user_id: &str) -> Option<&KeyBundle> {
        self.bundles.get(user_id)
    }

    /// The cached bundle ready for a handshake: its one-time prekey is dropped
    /// if that id was already consumed.
    pub fn bundle_for_handshake(&self, user_id: &str) -> Option<KeyBundle> {
        let mut bundle = self.bundles.get(user_id)?.clone();
        if let Some(otk) = &bundle.one_time_pre_key {
            if self.is_one_time_prekey_used(user_id, otk.id) {
                tracing::debug!(peer = %user_id, id = otk.id, "withholding consumed one-time prekey");
                bundle.one_time_pre_key = None;
            }
        }
        Some(bundle)
    }

    /// Mark a peer's one-time prekey as consumed. Idempotent.
    pub fn mark_one_time_prekey_used(&mut self, user_id: &str, id: u32) {
        self.used_one_time_prekeys
            .entry(user_id.to_string())
            .or_default()
            .insert(id);
    }

    pub fn is_one_time_prekey_used(&self, user_id: &str, id: u32) -> bool {
        self.used_one_time_prekeys
            .get(user_id)
            .is_some_and(|ids| ids.contains(&id))
    }

    pub fn remove_bundle(&mut self, user_id: &str) -> Option<KeyBundle> {
        self.bundles.remove(user_id)
    }

    pub fn bundle_count(&self) -> usize {
        self.bundles.len()
    }

    /// Forget everything held in memory (logout). Persisted state is untouched
    /// until the next `save`.
    pub fn clear(&mut self) {
        self.bundles.clear();
        self.used_one_time_prekeys.clear();
    }

    pub fn save(&self) -> Result<(), CryptoError> {
        let persisted = PersistedBundles {
            bundles: self
                .bundles
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            used_keys: self
                .used_one_time_prekeys
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        put_json(self.storage.as_ref(), BUNDLE_STORAGE_KEY, &persisted)
    }

    /// Restore the cache from storage. Used ids are merged, never dropped, so
    /// loading can't resurrect a consumed prekey.
    pub fn load(&mut self) -> Result<(), CryptoError> {
        let Some(persisted) =
            get_json::<PersistedBundles>(self.storage.as_ref(), BUNDLE_STORAGE_KEY)?
        else {
            return Ok(());
        };

        self.bundles.extend(persisted.bundles);
        for (user, ids) in persisted.used_keys {
            self.used_one_time_prekeys.entry(user).or_default().extend(ids);
        }
        Ok(())
    }
}
