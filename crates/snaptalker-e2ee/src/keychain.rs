use std::collections::HashMap;

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::CryptoError;

/// Trait for secure key storage — abstracts over the host backend.
///
/// Native hosts back this with the OS keystore; the engine only sees the
/// trait. Private key material and ratchet keys go through here and nowhere
/// else.
pub trait Keychain: Send + Sync {
    /// Store a key under a vault/key pair.
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// Retrieve a key from a vault/key pair.
    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Delete a key from a vault/key pair.
    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError>;

    /// Check if a key exists.
    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError>;

    /// List key names stored in a vault.
    fn list_keys(&self, vault: &str) -> Result<Vec<String>, CryptoError>;
}

// Vault and key constants used throughout the engine.

/// Vault for identity keys.
pub const VAULT_IDENTITY: &str = "identity";

/// Vault for signed and one-time prekeys.
pub const VAULT_PREKEYS: &str = "prekeys";
/// Current signed prekey record.
pub const KEY_SIGNED_PREKEY: &str = "signed_prekey";
/// Next free one-time prekey id.
pub const KEY_NEXT_PREKEY_ID: &str = "next_one_time_id";

/// Vault for ratchet session keys.
pub const VAULT_SESSIONS: &str = "sessions";

/// Key name of a user's identity key pair.
pub fn identity_key_name(user_id: &str) -> String {
    format!("identity_key_{user_id}")
}

/// Key name of a one-time prekey.
pub fn one_time_prekey_name(id: u32) -> String {
    format!("one_time:{id}")
}

/// Key name of the ratchet keys for an (owner, contact) session.
pub fn session_key_name(owner_id: &str, contact_id: &str) -> String {
    format!("session:{owner_id}:{contact_id}")
}

/// In-process keychain.
///
/// Values are wiped when removed or when the keychain is dropped. Useful for
/// tests and for hosts that hand key material to the engine for one login
/// only.
#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_name(vault: &str, key: &str) -> String {
        format!("{vault}/{key}")
    }
}

impl Keychain for MemoryKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .insert(Self::entry_name(vault, key), Zeroizing::new(data.to_vec()));
        Ok(())
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(&Self::entry_name(vault, key))
            .map(|v| v.to_vec()))
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        self.entries.lock().remove(&Self::entry_name(vault, key));
        Ok(())
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        Ok(self.entries.lock().contains_key(&Self::entry_name(vault, key)))
    }

    fn list_keys(&self, vault: &str) -> Result<Vec<String>, CryptoError> {
        let prefix = format!("{vault}/");
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
