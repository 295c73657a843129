//! Persistent key-value storage for the access credential.
//!
//! The session store mirrors its credential here so a restart can pick the
//! session back up. Backends are blocking and expected to be always available;
//! callers treat failures as best-effort.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use keyring::Entry;

/// Key the access credential is stored under.
pub const CREDENTIAL_KEY: &str = "auth_token";

/// Keychain service name
const SERVICE_NAME: &str = "storefront";

/// Storage file name in the cache directory
const STORAGE_FILE: &str = "session.json";

pub trait CredentialStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CredentialStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values().remove(key);
        Ok(())
    }
}

/// JSON map persisted in the cache directory.
pub struct FileStorage {
    cache_dir: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            lock: Mutex::new(()),
        }
    }

    fn storage_path(&self) -> PathBuf {
        self.cache_dir.join(STORAGE_FILE)
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        let path = self.storage_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        serde_json::from_str(&contents).context("Failed to parse session file")
    }

    fn save(&self, values: &HashMap<String, String>) -> Result<()> {
        let path = self.storage_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create cache directory")?;
        }
        let contents = serde_json::to_string_pretty(values)?;
        write_atomic(&path, &contents)
    }

    fn modify(&self, f: impl FnOnce(&mut HashMap<String, String>) -> bool) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut values = self.load()?;
        if f(&mut values) {
            self.save(&values)?;
        }
        Ok(())
    }
}

/// Write to a sibling temp file then rename, so a crash never leaves a
/// half-written session file behind.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| STORAGE_FILE.to_string());
    let tmp_path = path.with_file_name(format!("{}.{}.tmp", file_name, std::process::id()));
    std::fs::write(&tmp_path, contents).context("Failed to write session file")?;
    std::fs::rename(&tmp_path, path).context("Failed to replace session file")?;
    Ok(())
}

impl CredentialStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(self.load()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.modify(|values| {
            values.insert(key.to_string(), value.to_string());
            true
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.modify(|values| values.remove(key).is_some())
    }
}

/// OS keychain storage; one keychain entry per key.
#[derive(Debug, Default)]
pub struct KeyringStorage;

impl KeyringStorage {
    pub fn new() -> Self {
        Self
    }

    fn entry(key: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, key).context("Failed to create keyring entry")
    }
}

impl CredentialStorage for KeyringStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match Self::entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        Self::entry(key)?
            .set_password(value)
            .context("Failed to store credential in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        match Self::entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get(CREDENTIAL_KEY).expect("get"), None);

        storage.set(CREDENTIAL_KEY, "abc").expect("set");
        assert_eq!(storage.get(CREDENTIAL_KEY).expect("get").as_deref(), Some("abc"));

        storage.remove(CREDENTIAL_KEY).expect("remove");
        storage.remove(CREDENTIAL_KEY).expect("second remove is harmless");
        assert_eq!(storage.get(CREDENTIAL_KEY).expect("get"), None);
    }

    #[test]
    fn test_file_storage_survives_new_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache_dir = dir.path().join("nested");

        FileStorage::new(cache_dir.clone())
            .set(CREDENTIAL_KEY, "persisted")
            .expect("set");

        let reopened = FileStorage::new(cache_dir.clone());
        assert_eq!(
            reopened.get(CREDENTIAL_KEY).expect("get").as_deref(),
            Some("persisted")
        );

        reopened.remove(CREDENTIAL_KEY).expect("remove");
        assert_eq!(reopened.get(CREDENTIAL_KEY).expect("get"), None);
        assert!(cache_dir.join(STORAGE_FILE).exists());
    }

    #[test]
    fn test_file_storage_missing_file_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(dir.path().to_path_buf());
        assert_eq!(storage.get(CREDENTIAL_KEY).expect("get"), None);
        storage.remove(CREDENTIAL_KEY).expect("remove on empty");
        assert!(!dir.path().join(STORAGE_FILE).exists());
    }

    #[test]
    fn test_file_storage_rejects_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(STORAGE_FILE), "{not json").expect("write");
        let storage = FileStorage::new(dir.path().to_path_buf());
        assert!(storage.get(CREDENTIAL_KEY).is_err());
    }
}
