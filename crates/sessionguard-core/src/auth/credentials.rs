//! Credential storage across two lifetimes.
//!
//! The persistent scope survives restarts, the ephemeral scope lives only as
//! long as the process. A credential pair is only ever kept in one of them.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use keyring::Entry;
use tracing::{debug, warn};

use crate::models::{CredentialPair, UserProfile};

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const PROFILE_KEY: &str = "user_profile";

/// Every key the session layer may write; `clear` removes all of them.
const ALL_KEYS: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, PROFILE_KEY];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScope {
    Persistent,
    Ephemeral,
}

impl StorageScope {
    /// Scope implied by the "remember me" checkbox
    pub fn from_remember_me(remember_me: bool) -> Self {
        if remember_me {
            StorageScope::Persistent
        } else {
            StorageScope::Ephemeral
        }
    }

    pub fn other(&self) -> Self {
        match self {
            StorageScope::Persistent => StorageScope::Ephemeral,
            StorageScope::Ephemeral => StorageScope::Persistent,
        }
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageScope::Persistent => write!(f, "persistent"),
            StorageScope::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// Minimal string key-value store backing one scope.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

// ============================================================================
// Backends
// ============================================================================

/// In-process map. Used for the ephemeral scope.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        values.remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten on every mutation.
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file is missing or unreadable.
    pub fn open(path: PathBuf) -> Self {
        let values = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unparseable credential file");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    fn persist(&self, values: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write credential file {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("file store lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("file store lock poisoned"))?;
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// OS keychain, one entry per key under a shared service name.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entry(key).ok()?.get_password().ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store value in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

// ============================================================================
// Credential Store
// ============================================================================

/// Holds the credential pair and cached profile in one of two scopes.
/// Clone is cheap; clones share the same backends.
#[derive(Clone)]
pub struct CredentialStore {
    persistent: Arc<dyn KeyValueStore>,
    ephemeral: Arc<dyn KeyValueStore>,
    /// Serializes writes so a guarded write sees no concurrent save or clear
    writes: Arc<Mutex<()>>,
}

impl CredentialStore {
    pub fn new(persistent: Arc<dyn KeyValueStore>, ephemeral: Arc<dyn KeyValueStore>) -> Self {
        Self {
            persistent,
            ephemeral,
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Both scopes held in memory. Handy for tests and short-lived tools.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    fn backend(&self, scope: StorageScope) -> &dyn KeyValueStore {
        match scope {
            StorageScope::Persistent => self.persistent.as_ref(),
            StorageScope::Ephemeral => self.ephemeral.as_ref(),
        }
    }

    fn load_from(&self, scope: StorageScope) -> Option<CredentialPair> {
        let store = self.backend(scope);
        let access_token = store.get(ACCESS_TOKEN_KEY)?;
        let refresh_token = store.get(REFRESH_TOKEN_KEY)?;
        Some(CredentialPair {
            access_token,
            refresh_token,
        })
    }

    fn remove_all(&self, scope: StorageScope) {
        let store = self.backend(scope);
        for key in ALL_KEYS {
            if let Err(e) = store.remove(key) {
                warn!(%scope, key, error = %e, "Failed to remove stored value");
            }
        }
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write the pair into `scope`, first wiping anything held in the other scope.
    pub fn save(&self, pair: &CredentialPair, scope: StorageScope) -> Result<()> {
        let _guard = self.lock_writes();
        self.write_pair(pair, scope)
    }

    /// Replace the pair only while the stored refresh token is still `expected`,
    /// keeping its scope. Returns false, writing nothing, once the session changed.
    pub fn replace_if_current(&self, expected: &str, pair: &CredentialPair) -> Result<bool> {
        let _guard = self.lock_writes();
        let Some(scope) = self.active_scope() else {
            return Ok(false);
        };
        if self.load_from(scope).map(|p| p.refresh_token).as_deref() != Some(expected) {
            return Ok(false);
        }
        self.write_pair(pair, scope)?;
        Ok(true)
    }

    fn write_pair(&self, pair: &CredentialPair, scope: StorageScope) -> Result<()> {
        self.remove_all(scope.other());

        let store = self.backend(scope);
        store.set(ACCESS_TOKEN_KEY, &pair.access_token)?;
        store.set(REFRESH_TOKEN_KEY, &pair.refresh_token)?;
        debug!(%scope, "Saved credential pair");
        Ok(())
    }

    /// Persistent scope wins when both somehow hold a pair.
    pub fn load(&self) -> Option<CredentialPair> {
        self.load_from(StorageScope::Persistent)
            .or_else(|| self.load_from(StorageScope::Ephemeral))
    }

    /// Scope currently holding the pair, if any
    pub fn active_scope(&self) -> Option<StorageScope> {
        [StorageScope::Persistent, StorageScope::Ephemeral]
            .into_iter()
            .find(|scope| self.load_from(*scope).is_some())
    }

    pub fn access_token(&self) -> Option<String> {
        self.load().map(|pair| pair.access_token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.load().map(|pair| pair.refresh_token)
    }

    /// Remove the pair and cached profile from both scopes.
    pub fn clear(&self) {
        let _guard = self.lock_writes();
        self.remove_all_scopes();
    }

    /// Clear only while the stored refresh token is still `expected`
    /// (`None` meaning nothing usable is stored). Returns whether it cleared.
    pub fn clear_if_current(&self, expected: Option<&str>) -> bool {
        let _guard = self.lock_writes();
        if self.refresh_token().as_deref() != expected {
            return false;
        }
        self.remove_all_scopes();
        true
    }

    fn remove_all_scopes(&self) {
        self.remove_all(StorageScope::Persistent);
        self.remove_all(StorageScope::Ephemeral);
        debug!("Cleared credential store");
    }

    /// Cache the profile next to the pair. A no-op when logged out.
    pub fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        let Some(scope) = self.active_scope() else {
            return Ok(());
        };
        let json = serde_json::to_string(profile).context("Failed to serialize profile")?;
        self.backend(scope).set(PROFILE_KEY, &json)
    }

    pub fn load_profile(&self) -> Option<UserProfile> {
        let scope = self.active_scope()?;
        let json = self.backend(scope).get(PROFILE_KEY)?;
        serde_json::from_str(&json).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_backends() -> (CredentialStore, Arc<MemoryStore>, Arc<MemoryStore>) {
        let persistent = Arc::new(MemoryStore::new());
        let ephemeral = Arc::new(MemoryStore::new());
        let store = CredentialStore::new(persistent.clone(), ephemeral.clone());
        (store, persistent, ephemeral)
    }

    #[test]
    fn test_save_switches_scope_exclusively() {
        let (store, persistent, ephemeral) = store_with_backends();

        store
            .save(&CredentialPair::new("a1", "r1"), StorageScope::Persistent)
            .unwrap();
        assert_eq!(persistent.get(ACCESS_TOKEN_KEY).as_deref(), Some("a1"));
        assert!(ephemeral.get(ACCESS_TOKEN_KEY).is_none());

        store
            .save(&CredentialPair::new("a2", "r2"), StorageScope::Ephemeral)
            .unwrap();
        assert!(persistent.get(ACCESS_TOKEN_KEY).is_none());
        assert!(persistent.get(REFRESH_TOKEN_KEY).is_none());
        assert_eq!(ephemeral.get(REFRESH_TOKEN_KEY).as_deref(), Some("r2"));
        assert_eq!(store.active_scope(), Some(StorageScope::Ephemeral));
    }

    #[test]
    fn test_load_prefers_persistent() {
        let (store, persistent, ephemeral) = store_with_backends();
        ephemeral.set(ACCESS_TOKEN_KEY, "eph").unwrap();
        ephemeral.set(REFRESH_TOKEN_KEY, "eph-r").unwrap();
        persistent.set(ACCESS_TOKEN_KEY, "per").unwrap();
        persistent.set(REFRESH_TOKEN_KEY, "per-r").unwrap();

        assert_eq!(store.load(), Some(CredentialPair::new("per", "per-r")));
    }

    #[test]
    fn test_half_written_pair_is_absent() {
        let (store, persistent, _) = store_with_backends();
        persistent.set(ACCESS_TOKEN_KEY, "orphan").unwrap();
        assert!(store.load().is_none());
        assert!(store.access_token().is_none());
    }

    #[test]
    fn test_clear_removes_both_scopes() {
        let (store, persistent, ephemeral) = store_with_backends();
        persistent.set(ACCESS_TOKEN_KEY, "stale").unwrap();
        persistent.set(PROFILE_KEY, "{}").unwrap();
        store
            .save(&CredentialPair::new("a", "r"), StorageScope::Ephemeral)
            .unwrap();
        ephemeral.set(PROFILE_KEY, "{}").unwrap();

        store.clear();
        for key in ALL_KEYS {
            assert!(persistent.get(key).is_none(), "persistent still has {}", key);
            assert!(ephemeral.get(key).is_none(), "ephemeral still has {}", key);
        }
        assert!(store.load().is_none());
    }

    #[test]
    fn test_guarded_replace_keeps_scope_and_skips_changed_session() {
        let store = CredentialStore::in_memory();
        store
            .save(&CredentialPair::new("a1", "r1"), StorageScope::Ephemeral)
            .unwrap();

        assert!(store.replace_if_current("r1", &CredentialPair::new("a2", "r2")).unwrap());
        assert_eq!(store.active_scope(), Some(StorageScope::Ephemeral));
        assert_eq!(store.load(), Some(CredentialPair::new("a2", "r2")));

        // r1 is gone now, so a second writer holding it loses
        assert!(!store.replace_if_current("r1", &CredentialPair::new("a3", "r3")).unwrap());
        assert_eq!(store.load(), Some(CredentialPair::new("a2", "r2")));

        store.clear();
        assert!(!store.replace_if_current("r2", &CredentialPair::new("a4", "r4")).unwrap());
        assert!(store.load().is_none());
    }

    #[test]
    fn test_guarded_clear_spares_newer_session() {
        let store = CredentialStore::in_memory();
        store
            .save(&CredentialPair::new("fresh", "fresh-r"), StorageScope::Persistent)
            .unwrap();

        assert!(!store.clear_if_current(Some("r1")));
        assert_eq!(store.refresh_token().as_deref(), Some("fresh-r"));

        assert!(store.clear_if_current(Some("fresh-r")));
        assert!(store.load().is_none());
        // Nothing stored matches `None`
        assert!(store.clear_if_current(None));
    }

    #[test]
    fn test_profile_cached_in_active_scope() {
        let (store, persistent, ephemeral) = store_with_backends();
        let profile: UserProfile = serde_json::from_str(r#"{"id": "1", "name": "Ana"}"#).unwrap();

        // Logged out: nothing written
        store.save_profile(&profile).unwrap();
        assert!(persistent.get(PROFILE_KEY).is_none());

        store
            .save(&CredentialPair::new("a", "r"), StorageScope::Ephemeral)
            .unwrap();
        store.save_profile(&profile).unwrap();
        assert!(ephemeral.get(PROFILE_KEY).is_some());
        assert_eq!(store.load_profile(), Some(profile));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let file = FileStore::open(path.clone());
        file.set(ACCESS_TOKEN_KEY, "a1").unwrap();
        file.set(REFRESH_TOKEN_KEY, "r1").unwrap();
        drop(file);

        let reopened = Arc::new(FileStore::open(path.clone()));
        let store = CredentialStore::new(reopened.clone(), Arc::new(MemoryStore::new()));
        assert_eq!(store.load(), Some(CredentialPair::new("a1", "r1")));

        store.clear();
        let contents = std::fs::read_to_string(&path).unwrap();
        let values: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_file_store_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "not json").unwrap();

        let file = FileStore::open(path);
        assert!(file.get(ACCESS_TOKEN_KEY).is_none());
    }
}
