//! Per-contact ratchet session.
//!
//! A single chain shared by both directions: every encrypt or decrypt uses
//! the current chain key and then replaces it with `HKDF(chain, "ChainKey")`.
//! Both parties stay in step as long as messages are processed in the same
//! order on each side.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::cipher::{hkdf32, open, seal};
use crate::error::CryptoError;
use crate::keychain::{session_key_name, Keychain, VAULT_SESSIONS};
use crate::prekeys::unix_millis;
use crate::storage::{get_json, put_json, AppStorage};
use crate::x3dh::SharedSecret;

const ROOT_KEY_INFO: &[u8] = b"RootKey";
const CHAIN_KEY_INFO: &[u8] = b"ChainKey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
}

#[derive(Clone, ZeroizeOnDrop)]
struct RatchetKeys {
    root_key: [u8; 32],
    chain_key: [u8; 32],
}

impl RatchetKeys {
    fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(64));
        out.extend_from_slice(&self.root_key);
        out.extend_from_slice(&self.chain_key);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::StorageError(format!(
                "session keys must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut keys = Self {
            root_key: [0u8; 32],
            chain_key: [0u8; 32],
        };
        keys.root_key.copy_from_slice(&bytes[..32]);
        keys.chain_key.copy_from_slice(&bytes[32..]);
        Ok(keys)
    }
}

/// One-way ratchet step.
fn next_chain_key(chain_key: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    hkdf32(None, chain_key, CHAIN_KEY_INFO)
}

/// Ciphertext plus the ratchet metadata that travels with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    pub ciphertext: String,
    pub iv: String,
    pub message_number: u64,
    pub previous_chain_length: u64,
}

impl EncryptedMessage {
    fn aad(message_number: u64, previous_chain_length: u64) -> [u8; 16] {
        let mut aad = [0u8; 16];
        aad[..8].copy_from_slice(&message_number.to_be_bytes());
        aad[8..].copy_from_slice(&previous_chain_length.to_be_bytes());
        aad
    }
}

/// The storage-safe part of a session. No key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub owner_id: String,
    pub contact_id: String,
    pub message_number: u64,
    pub previous_chain_length: u64,
    pub updated_at: u64,
}

pub fn session_storage_key(owner_id: &str, contact_id: &str) -> String {
    format!("session_{owner_id}_{contact_id}")
}

#[derive(Clone)]
pub struct Session {
    owner_id: String,
    contact_id: String,
    keys: Option<RatchetKeys>,
    message_number: u64,
    previous_chain_length: u64,
}

impl Session {
    pub fn new(owner_id: &str, contact_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            contact_id: contact_id.to_string(),
            keys: None,
            message_number: 0,
            previous_chain_length: 0,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn contact_id(&self) -> &str {
        &self.contact_id
    }

    pub fn state(&self) -> SessionState {
        if self.keys.is_some() {
            SessionState::Active
        } else {
            SessionState::Uninitialized
        }
    }

    pub fn message_number(&self) -> u64 {
        self.message_number
    }

    pub fn previous_chain_length(&self) -> u64 {
        self.previous_chain_length
    }

    /// Seed the session from a handshake secret. Allowed once.
    ///
    /// A session restored from storage without its keys keeps its counter;
    /// the old count becomes `previous_chain_length`.
    pub fn initialize(&mut self, shared_secret: &SharedSecret) -> Result<(), CryptoError> {
        if self.keys.is_some() {
            return Err(CryptoError::SessionError(format!(
                "session with {} is already initialized",
                self.contact_id
            )));
        }

        let root_key = hkdf32(None, shared_secret.as_bytes(), ROOT_KEY_INFO)?;
        let chain_key = hkdf32(None, &root_key, CHAIN_KEY_INFO)?;
        self.keys = Some(RatchetKeys {
            root_key,
            chain_key,
        });
        if self.message_number > 0 {
            self.previous_chain_length = self.message_number;
        }
        Ok(())
    }

    fn active_keys(&self) -> Result<&RatchetKeys, CryptoError> {
        self.keys.as_ref().ok_or_else(|| {
            CryptoError::SessionError(format!("session with {} is not initialized", self.contact_id))
        })
    }

    /// Encrypt under the current chain key, then step the chain.
    ///
    /// Nothing is mutated unless encryption and the ratchet step both succeed.
    pub fn encrypt_outgoing(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        let keys = self.active_keys()?;

        let message_number = self.message_number + 1;
        let aad = EncryptedMessage::aad(message_number, self.previous_chain_length);
        let (ciphertext, iv) = seal(&keys.chain_key, plaintext, &aad)?;
        let chain_key = next_chain_key(&keys.chain_key)?;

        let root_key = keys.root_key;
        self.keys = Some(RatchetKeys {
            root_key,
            chain_key,
        });
        self.message_number = message_number;

        Ok(EncryptedMessage {
            ciphertext: BASE64.encode(ciphertext),
            iv: BASE64.encode(iv),
            message_number,
            previous_chain_length: self.previous_chain_length,
        })
    }

    /// Decrypt under the current chain key, then step the chain. The key that
    /// opened a message is gone afterwards, so a replay fails.
    ///
    /// On failure the session is left exactly as it was.
    pub fn decrypt_incoming(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        let keys = self.active_keys()?;

        let ciphertext = BASE64
            .decode(&message.ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("ciphertext encoding: {e}")))?;
        let iv = BASE64
            .decode(&message.iv)
            .map_err(|e| CryptoError::DecryptionFailed(format!("iv encoding: {e}")))?;
        let aad = EncryptedMessage::aad(message.message_number, message.previous_chain_length);

        let plaintext = open(&keys.chain_key, &iv, &ciphertext, &aad)?;
        let chain_key = next_chain_key(&keys.chain_key)?;

        let root_key = keys.root_key;
        self.keys = Some(RatchetKeys {
            root_key,
            chain_key,
        });
        Ok(plaintext)
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            owner_id: self.owner_id.clone(),
            contact_id: self.contact_id.clone(),
            message_number: self.message_number,
            previous_chain_length: self.previous_chain_length,
            updated_at: unix_millis(),
        }
    }

    /// Persist counters to app storage and keys to the keychain.
    pub fn save_to_storage(
        &self,
        storage: &dyn AppStorage,
        keychain: &dyn Keychain,
    ) -> Result<(), CryptoError> {
        let key_name = session_key_name(&self.owner_id, &self.contact_id);
        match &self.keys {
            Some(keys) => keychain.store_key(VAULT_SESSIONS, &key_name, &keys.to_bytes())?,
            None => keychain.delete_key(VAULT_SESSIONS, &key_name)?,
        }
        put_json(
            storage,
            &session_storage_key(&self.owner_id, &self.contact_id),
            &self.record(),
        )
    }

    /// Restore a session. A record whose keys are missing from the keychain
    /// comes back `Uninitialized` with its counters intact.
    pub fn load_from_storage(
        owner_id: &str,
        contact_id: &str,
        storage: &dyn AppStorage,
        keychain: &dyn Keychain,
    ) -> Result<Option<Self>, CryptoError> {
        let Some(record) =
            get_json::<SessionRecord>(storage, &session_storage_key(owner_id, contact_id))?
        else {
            return Ok(None);
        };

        let keys = keychain
            .load_key(VAULT_SESSIONS, &session_key_name(owner_id, contact_id))?
            .map(|bytes| {
                let bytes = Zeroizing::new(bytes);
                RatchetKeys::from_bytes(&bytes)
            })
            .transpose()?;

        if keys.is_none() {
            tracing::warn!(contact = %contact_id, "session record has no keys, handshake required");
        }

        Ok(Some(Self {
            owner_id: record.owner_id,
            contact_id: record.contact_id,
            keys,
            message_number: record.message_number,
            previous_chain_length: record.previous_chain_length,
        }))
    }

    pub fn delete_from_storage(
        owner_id: &str,
        contact_id: &str,
        storage: &dyn AppStorage,
        keychain: &dyn Keychain,
    ) -> Result<(), CryptoError> {
        keychain.delete_key(VAULT_SESSIONS, &session_key_name(owner_id, contact_id))?;
        storage.remove(&session_storage_key(owner_id, contact_id))
    }

    /// Contacts with a persisted session for `owner_id`.
    pub fn stored_contacts(
        owner_id: &str,
        storage: &dyn AppStorage,
    ) -> Result<Vec<String>, CryptoError> {
        let prefix = session_storage_key(owner_id, "");
        Ok(storage
            .keys_with_prefix(&prefix)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Raw keys for an encrypted backup.
    pub(crate) fn export_keys(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.keys.as_ref().map(RatchetKeys::to_bytes)
    }

    pub(crate) fn from_backup(record: &SessionRecord, keys: Option<&[u8]>) -> Result<Self, CryptoError> {
        Ok(Self {
            owner_id: record.owner_id.clone(),
            contact_id: record.contact_id.clone(),
            keys: keys.map(RatchetKeys::from_bytes).transpose()?,
            message_number: record.message_number,
            previous_chain_length: record.previous_chain_length,
        })
    }

    #[cfg(test)]
    fn chain_key(&self) -> [u8; 32] {
        self.keys.as_ref().map(|k| k.chain_key).unwrap_or_default()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("owner_id", &self.owner_id)
            .field("contact_id", &self.contact_id)
            .field("state", &self.state())
            .field("message_number", &self.message_number)
            .field("previous_chain_length", &self.previous_chain_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryKeychain;
    use crate::storage::MemoryStorage;

    fn seeded_pair() -> (Session, Session) {
        let secret = SharedSecret::from_bytes([42u8; 32]);
        let mut alice = Session::new("alice", "bob");
        let mut bob = Session::new("bob", "alice");
        alice.initialize(&secret).unwrap();
        bob.initialize(&secret).unwrap();
        (alice, bob)
    }

    #[test]
    fn round_trip_between_parties() {
        let (mut alice, mut bob) = seeded_pair();

        for text in ["hi", "", "third message with more text"] {
            let encrypted = alice.encrypt_outgoing(text.as_bytes()).unwrap();
            assert_eq!(bob.decrypt_incoming(&encrypted).unwrap(), text.as_bytes());
        }

        // the shared chain also carries replies
        let reply = bob.encrypt_outgoing(b"reply").unwrap();
        assert_eq!(alice.decrypt_incoming(&reply).unwrap(), b"reply");
    }

    #[test]
    fn same_session_round_trip() {
        let mut session = Session::new("alice", "bob");
        session.initialize(&SharedSecret::from_bytes([1u8; 32])).unwrap();

        // decrypting on the state the message was encrypted under
        let before = session.clone();
        let encrypted = session.encrypt_outgoing(b"P").unwrap();
        let mut replay = before;
        assert_eq!(replay.decrypt_incoming(&encrypted).unwrap(), b"P");
    }

    #[test]
    fn message_number_counts_encryptions() {
        let (mut alice, _) = seeded_pair();
        let mut seen = Vec::new();
        for n in 1..=5u64 {
            seen.push(alice.chain_key());
            let encrypted = alice.encrypt_outgoing(b"x").unwrap();
            assert_eq!(encrypted.message_number, n);
            assert_eq!(alice.message_number(), n);
        }

        // earlier chain keys are not reachable by stepping a later one
        let mut key = alice.chain_key();
        for _ in 0..10 {
            key = next_chain_key(&key).unwrap();
            assert!(!seen.contains(&key));
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn replay_fails() {
        let (mut alice, mut bob) = seeded_pair();
        let encrypted = alice.encrypt_outgoing(b"once").unwrap();

        assert!(bob.decrypt_incoming(&encrypted).is_ok());
        assert!(matches!(
            bob.decrypt_incoming(&encrypted),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn every_flipped_bit_is_rejected() {
        let (mut alice, bob) = seeded_pair();
        let encrypted = alice.encrypt_outgoing(b"tamper me").unwrap();
        let raw = BASE64.decode(&encrypted.ciphertext).unwrap();

        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut flipped = raw.clone();
                flipped[byte] ^= 1 << bit;
                let mut tampered = encrypted.clone();
                tampered.ciphertext = BASE64.encode(&flipped);

                let mut receiver = bob.clone();
                assert!(matches!(
                    receiver.decrypt_incoming(&tampered),
                    Err(CryptoError::DecryptionFailed(_))
                ));
                // failed decrypts leave the chain untouched
                assert_eq!(receiver.chain_key(), bob.chain_key());
            }
        }

        let mut tampered = encrypted.clone();
        tampered.message_number += 1;
        let mut receiver = bob.clone();
        assert!(receiver.decrypt_incoming(&tampered).is_err());

        let mut receiver = bob;
        assert_eq!(receiver.decrypt_incoming(&encrypted).unwrap(), b"tamper me");
    }

    #[test]
    fn uninitialized_session_refuses_work() {
        let mut session = Session::new("alice", "bob");
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(matches!(
            session.encrypt_outgoing(b"x"),
            Err(CryptoError::SessionError(_))
        ));
    }

    #[test]
    fn initialize_only_once() {
        let (mut alice, _) = seeded_pair();
        assert!(matches!(
            alice.initialize(&SharedSecret::from_bytes([2u8; 32])),
            Err(CryptoError::SessionError(_))
        ));
    }

    #[test]
    fn persistence_keeps_keys_out_of_app_storage() {
        let storage = MemoryStorage::new();
        let keychain = MemoryKeychain::new();
        let (mut alice, mut bob) = seeded_pair();
        alice.encrypt_outgoing(b"1").unwrap();
        alice.save_to_storage(&storage, &keychain).unwrap();

        let raw = storage.get(&session_storage_key("alice", "bob")).unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record["messageNumber"], 1);
        assert!(record.get("chainKey").is_none());
        assert!(keychain.key_exists(VAULT_SESSIONS, "session:alice:bob").unwrap());

        let mut restored = Session::load_from_storage("alice", "bob", &storage, &keychain)
            .unwrap()
            .unwrap();
        assert_eq!(restored.state(), SessionState::Active);
        assert_eq!(restored.message_number(), 1);

        bob.encrypt_outgoing(b"skip").unwrap();
        let next = restored.encrypt_outgoing(b"2").unwrap();
        assert_eq!(next.message_number, 2);
        assert_eq!(bob.decrypt_incoming(&next).unwrap(), b"2");

        assert_eq!(
            Session::stored_contacts("alice", &storage).unwrap(),
            vec!["bob".to_string()]
        );
    }

    #[test]
    fn record_without_keys_loads_uninitialized() {
        let storage = MemoryStorage::new();
        let keychain = MemoryKeychain::new();
        let (mut alice, _) = seeded_pair();
        alice.encrypt_outgoing(b"1").unwrap();
        alice.encrypt_outgoing(b"2").unwrap();
        alice.save_to_storage(&storage, &keychain).unwrap();
        keychain.delete_key(VAULT_SESSIONS, "session:alice:bob").unwrap();

        let mut restored = Session::load_from_storage("alice", "bob", &storage, &keychain)
            .unwrap()
            .unwrap();
        assert_eq!(restored.state(), SessionState::Uninitialized);

        restored.initialize(&SharedSecret::from_bytes([3u8; 32])).unwrap();
        assert_eq!(restored.message_number(), 2);
        assert_eq!(restored.previous_chain_length(), 2);
        assert_eq!(restored.encrypt_outgoing(b"3").unwrap().message_number, 3);
    }

    #[test]
    fn delete_removes_both_halves() {
        let storage = MemoryStorage::new();
        let keychain = MemoryKeychain::new();
        let (alice, _) = seeded_pair();
        alice.save_to_storage(&storage, &keychain).unwrap();

        Session::delete_from_storage("alice", "bob", &storage, &keychain).unwrap();
        assert!(Session::load_from_storage("alice", "bob", &storage, &keychain)
            .unwrap()
            .is_none());
        assert!(!keychain.key_exists(VAULT_SESSIONS, "session:alice:bob").unwrap());
    }
}
