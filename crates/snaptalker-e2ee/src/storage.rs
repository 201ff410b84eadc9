//! Plain durable application storage.
//!
//! Holds only storage-safe state: bundle caches, session counters, the
//! offline queue. Anything secret goes through [`crate::Keychain`] instead.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::CryptoError;

pub trait AppStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), CryptoError>;

    fn remove(&self, key: &str) -> Result<(), CryptoError>;

    /// All keys starting with `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CryptoError>;
}

#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AppStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        self.items.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CryptoError> {
        self.items.lock().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CryptoError> {
        Ok(self
            .items
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One file per key inside a directory.
///
/// File names are the hex-encoded key so arbitrary user ids are safe on any
/// filesystem. Writes go to a temp file first and are renamed into place.
pub struct DirStorage {
    dir: PathBuf,
}

impl DirStorage {
    pub fn open(dir: &Path) -> Result<Self, CryptoError> {
        fs::create_dir_all(dir)
            .map_err(|e| CryptoError::StorageError(format!("create {}: {e}", dir.display())))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }
}

impl AppStorage for DirStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CryptoError::StorageError(format!("read {key}: {e}"))),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).map_err(|e| CryptoError::StorageError(format!("write {key}: {e}")))?;
        fs::rename(&tmp, &path).map_err(|e| CryptoError::StorageError(format!("rename {key}: {e}")))
    }

    fn remove(&self, key: &str) -> Result<(), CryptoError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryptoError::StorageError(format!("remove {key}: {e}"))),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CryptoError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| CryptoError::StorageError(format!("list {}: {e}", self.dir.display())))?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CryptoError::StorageError(e.to_string()))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let Ok(raw) = hex::decode(stem) else { continue };
            let Ok(key) = String::from_utf8(raw) else { continue };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Read and deserialize a JSON value, `None` if the key is absent.
pub(crate) fn get_json<T: serde::de::DeserializeOwned>(
    storage: &dyn AppStorage,
    key: &str,
) -> Result<Option<T>, CryptoError> {
    storage
        .get(key)?
        .map(|bytes| serde_json::from_slice(&bytes).map_err(CryptoError::from))
        .transpose()
}

pub(crate) fn put_json<T: serde::Serialize>(
    storage: &dyn AppStorage,
    key: &str,
    value: &T,
) -> Result<(), CryptoError> {
    let bytes = serde_json::to_vec(value)?;
    storage.put(key, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_prefix_listing() {
        let storage = MemoryStorage::new();
        storage.put("session_a_b", b"1").unwrap();
        storage.put("session_a_c", b"2").unwrap();
        storage.put("offline_message_queue", b"[]").unwrap();

        assert_eq!(
            storage.keys_with_prefix("session_a_").unwrap(),
            vec!["session_a_b".to_string(), "session_a_c".to_string()]
        );
    }

    #[test]
    fn dir_storage_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let storage = DirStorage::open(dir.path()).unwrap();
            storage.put("session_alice_bob/x", b"{\"n\":1}").unwrap();
            storage.put("other", b"2").unwrap();
        }

        let storage = DirStorage::open(dir.path()).unwrap();
        assert_eq!(
            storage.get("session_alice_bob/x").unwrap().as_deref(),
            Some(b"{\"n\":1}".as_slice())
        );
        assert_eq!(
            storage.keys_with_prefix("session_").unwrap(),
            vec!["session_alice_bob/x".to_string()]
        );

        storage.remove("other").unwrap();
        storage.remove("other").unwrap();
        assert!(storage.get("other").unwrap().is_none());
    }
}
