//! Built-in no-op plugin implementations.
//!
//! These are the `"default"` registry entries. The crypto manager keeps a
//! key ledger in memory and pretends the store is always reachable, which is
//! enough for development hosts without loop device or cryptsetup access.

use crate::config::CredstoreConfig;
use crate::error::{StoreError, StoreResult};
use credstore_provider::{AccessControlManager, CryptoManager, Key, SecretsStorage};
use log::debug;
use std::fs;
use std::path::PathBuf;

/// Crypto manager that stores nothing encrypted. The mount path is a plain
/// directory under the configured storage path, created at construction, so
/// the store reports set up and mounted before any key arrives.
pub struct DefaultCryptoManager {
    mount_path: PathBuf,
    staged: Option<Key>,
    slots: Vec<Key>,
    mounted: bool,
}

impl DefaultCryptoManager {
    pub fn from_config(config: &CredstoreConfig) -> StoreResult<Self> {
        let mount_path = config.mount_path();
        fs::create_dir_all(&mount_path)?;
        Ok(Self {
            mount_path,
            staged: None,
            slots: Vec::new(),
            mounted: true,
        })
    }

    fn staged_key(&self) -> StoreResult<Key> {
        self.staged
            .clone()
            .ok_or_else(|| StoreError::Crypto("no encryption key staged".into()))
    }
}

impl CryptoManager for DefaultCryptoManager {
    type Error = StoreError;

    fn set_encryption_key(&mut self, key: Key) {
        self.staged = Some(key);
    }

    fn setup_file_system(&mut self) -> StoreResult<()> {
        let key = self.staged_key()?;
        fs::create_dir_all(&self.mount_path)?;
        self.slots = vec![key];
        self.mounted = true;
        debug!("plain-directory store ready at {}", self.mount_path.display());
        Ok(())
    }

    fn mount_file_system(&mut self) -> StoreResult<()> {
        // An unkeyed plain directory has nothing to unlock.
        if !self.slots.is_empty() {
            let key = self.staged_key()?;
            if !self.slots.contains(&key) {
                return Err(StoreError::Crypto("key does not unlock store".into()));
            }
        }
        fs::create_dir_all(&self.mount_path)?;
        self.mounted = true;
        Ok(())
    }

    fn unmount_file_system(&mut self) -> StoreResult<()> {
        self.mounted = false;
        Ok(())
    }

    fn add_encryption_key(&mut self, key: &Key, existing: &Key) -> StoreResult<()> {
        if !self.slots.contains(existing) {
            return Err(StoreError::Crypto("existing key does not unlock store".into()));
        }
        if !self.slots.contains(key) {
            self.slots.push(key.clone());
        }
        Ok(())
    }

    fn remove_encryption_key(&mut self, key: &Key, remaining: &Key) -> StoreResult<()> {
        if !self.slots.contains(remaining) {
            return Err(StoreError::Crypto(
                "remaining key does not unlock store".into(),
            ));
        }
        self.slots.retain(|k| k != key);
        Ok(())
    }

    fn encryption_key_in_use(&mut self, key: &Key) -> bool {
        if self.mounted {
            return self.slots.contains(key);
        }
        if self.slots.contains(key) {
            self.staged = Some(key.clone());
            self.mounted = true;
            return true;
        }
        false
    }

    fn file_system_is_setup(&self) -> bool {
        true
    }

    fn file_system_is_mounted(&self) -> bool {
        self.mounted
    }

    fn file_system_mount_path(&self) -> PathBuf {
        self.mount_path.clone()
    }

    fn backup_files(&self) -> Vec<PathBuf> {
        vec![self.mount_path.clone()]
    }
}

/// Allows every peer. Real deployments configure a policy plugin.
#[derive(Debug, Default)]
pub struct DefaultAccessControlManager;

impl AccessControlManager for DefaultAccessControlManager {
    fn is_peer_allowed(&self, _peer: &str, _method: &str) -> bool {
        true
    }
}

/// Storage plugin that persists nothing. Tracks open state only.
#[derive(Debug, Default)]
pub struct NullSecretsStorage {
    open: bool,
}

impl SecretsStorage for NullSecretsStorage {
    type Error = StoreError;

    fn open(&mut self, _path: &std::path::Path) -> StoreResult<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
