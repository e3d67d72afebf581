//! File-based key manager.
//!
//! Watches a directory for key files by polling. Every regular file is
//! decoded as key material; appearing files report `Inserted`, vanishing
//! files report `Disabled` then `Removed`. Hardware-token managers plug in
//! through the same `KeyManager` contract.

use credstore_core::config::CredstoreConfig;
use credstore_core::error::{StoreError, StoreResult};
use credstore_core::keyfile;
use credstore_provider::{Key, KeyEventReporter, KeyManager};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

pub const MANAGER_NAME: &str = "file";

pub struct FileKeyManager {
    directory: PathBuf,
    expected_sha256: Option<String>,
    poll_interval: Duration,
    started: bool,
}

impl FileKeyManager {
    pub fn from_config(config: &CredstoreConfig) -> Self {
        Self {
            directory: config.key_directory(),
            expected_sha256: config
                .keys
                .expected_sha256
                .as_ref()
                .map(|digest| digest.trim().to_ascii_lowercase())
                .filter(|digest| !digest.is_empty()),
            poll_interval: Duration::from_secs(config.keys.poll_interval_secs.max(1)),
            started: false,
        }
    }

    fn scan(directory: &Path, expected_sha256: Option<&str>) -> HashSet<Key> {
        let mut keys = HashSet::new();
        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("key directory {} unreadable: {err}", directory.display());
                return keys;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let key = match keyfile::read_key_file(&path) {
                Ok(key) => key,
                Err(err) => {
                    warn!("ignoring {}: {err}", path.display());
                    continue;
                }
            };
            if let Some(expected) = expected_sha256 {
                let digest = hex::encode(Sha256::digest(key.as_bytes()));
                if digest != expected {
                    warn!(
                        "ignoring {}: key digest does not match keys.expected_sha256",
                        path.display()
                    );
                    continue;
                }
            }
            keys.insert(key);
        }
        keys
    }
}

impl KeyManager for FileKeyManager {
    type Error = StoreError;

    fn name(&self) -> &str {
        MANAGER_NAME
    }

    fn setup(&mut self, reporter: KeyEventReporter) -> StoreResult<()> {
        if self.started {
            return Err(StoreError::AlreadyInitialized("file key manager"));
        }
        self.started = true;

        let directory = self.directory.clone();
        let expected = self.expected_sha256.clone();
        let interval = self.poll_interval;

        thread::Builder::new()
            .name("key-poll".into())
            .spawn(move || {
                let mut known: HashSet<Key> = HashSet::new();
                let mut first_scan = true;
                loop {
                    let current = Self::scan(&directory, expected.as_deref());

                    if first_scan && current.is_empty() {
                        reporter.no_keys();
                    }
                    first_scan = false;

                    for key in current.difference(&known) {
                        reporter.key_inserted(key.clone());
                    }
                    for key in known.difference(&current) {
                        reporter.key_disabled(key.clone());
                        reporter.key_removed(key.clone());
                    }

                    known = current;
                    thread::sleep(interval);
                }
            })?;

        Ok(())
    }
}
