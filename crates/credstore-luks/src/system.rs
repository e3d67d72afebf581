//! LUKS-backed crypto manager.
//!
//! The encrypted store is a regular file attached to a loop device, holding
//! a LUKS container with the secrets filesystem inside. State advances
//! strictly forward through [`MountState`]; any failure unwinds every
//! acquired resource in reverse order.

use crate::cryptsetup::{mapper_device, Cryptsetup};
use crate::loopdev::Losetup;
use crate::mount::FilesystemTools;
use credstore_core::config::CredstoreConfig;
use credstore_core::error::{StoreError, StoreResult};
use credstore_provider::{CryptoManager, Key, MountState};
use log::{debug, error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct LuksCryptoManager {
    partition_path: PathBuf,
    mount_path: PathBuf,
    mapping_name: String,
    store_size: u64,
    staged: Option<Key>,
    state: MountState,
    loop_device: Option<String>,
    cryptsetup: Cryptsetup,
    losetup: Losetup,
    fs_tools: FilesystemTools,
}

impl LuksCryptoManager {
    /// Resolve the external tools and derive paths from `config`. Fails fast
    /// when a required binary is missing.
    pub fn from_config(config: &CredstoreConfig) -> StoreResult<Self> {
        let storage_dir = config.storage_dir();
        let mapping_name = mapping_name_for(&storage_dir);
        Ok(Self {
            partition_path: config.partition_file(),
            mount_path: config.mount_path(),
            mapping_name,
            store_size: config.storage.size,
            staged: None,
            state: MountState::Unmounted,
            loop_device: None,
            cryptsetup: Cryptsetup::resolve(COMMAND_TIMEOUT)?,
            losetup: Losetup::resolve(COMMAND_TIMEOUT)?,
            fs_tools: FilesystemTools::resolve(config.storage.file_system_type, COMMAND_TIMEOUT)?,
        })
    }

    pub fn mount_state(&self) -> MountState {
        self.state
    }

    fn staged_key(&self) -> StoreResult<Key> {
        self.staged
            .clone()
            .ok_or_else(|| StoreError::Crypto("no encryption key staged".into()))
    }

    /// Device cryptsetup key-slot operations should target: the attached
    /// loop device when present, the backing file otherwise.
    fn key_slot_device(&self) -> String {
        self.loop_device
            .clone()
            .unwrap_or_else(|| self.partition_path.to_string_lossy().into_owned())
    }

    fn attach_loop(&mut self) -> StoreResult<()> {
        let device = self.losetup.attach(&self.partition_path)?;
        debug!("attached {} at {device}", self.partition_path.display());
        self.loop_device = Some(device);
        self.state = MountState::LoopAttached;
        Ok(())
    }

    fn allocate_partition(&self) -> StoreResult<()> {
        if let Some(parent) = self.partition_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&self.partition_path)?;
        file.set_len(self.store_size)?;
        file.sync_all()?;
        Ok(())
    }

    /// Step the state machine down to `Unmounted`, attempting every
    /// remaining step even after one fails. Returns whether every reachable
    /// step succeeded.
    fn unwind(&mut self) -> bool {
        let mut all_ok = true;

        if self.state >= MountState::Mounted {
            match self.fs_tools.unmount(&self.mount_path) {
                Ok(()) => debug!("unmounted {}", self.mount_path.display()),
                Err(err) => {
                    error!("failed to unmount {}: {err}", self.mount_path.display());
                    all_ok = false;
                }
            }
            self.state = MountState::BlockEncryptionOpened;
        }

        if self.state >= MountState::BlockEncryptionOpened {
            match self.cryptsetup.close(&self.mapping_name) {
                Ok(()) => debug!("closed mapping {}", self.mapping_name),
                Err(err) => {
                    error!("failed to close mapping {}: {err}", self.mapping_name);
                    all_ok = false;
                }
            }
            self.state = MountState::LoopAttached;
        }

        if self.state >= MountState::LoopAttached {
            // take() so a second unwind cannot detach twice
            if let Some(device) = self.loop_device.take() {
                match self.losetup.detach(&device) {
                    Ok(()) => debug!("detached {device}"),
                    Err(err) => {
                        error!("failed to detach {device}: {err}");
                        all_ok = false;
                    }
                }
            }
            self.state = MountState::Unmounted;
        }

        all_ok
    }

    fn try_setup(&mut self, key: &Key) -> StoreResult<()> {
        self.allocate_partition()?;
        self.attach_loop()?;

        let device = self.key_slot_device();
        self.cryptsetup.luks_format(&device, key)?;
        self.state = MountState::BlockEncryptionFormatted;

        self.cryptsetup.open(&device, &self.mapping_name, key)?;
        self.state = MountState::BlockEncryptionOpened;

        let mapper = mapper_device(&self.mapping_name);
        let mapper_arg = mapper.to_string_lossy().into_owned();
        self.fs_tools.make_file_system(&mapper_arg)?;

        self.fs_tools.mount(&mapper_arg, &self.mount_path)?;
        self.state = MountState::Mounted;
        Ok(())
    }

    fn try_mount(&mut self, key: &Key) -> StoreResult<()> {
        self.attach_loop()?;

        let device = self.key_slot_device();
        self.cryptsetup.open(&device, &self.mapping_name, key)?;
        self.state = MountState::BlockEncryptionOpened;

        let mapper = mapper_device(&self.mapping_name);
        let mapper_arg = mapper.to_string_lossy().into_owned();
        self.fs_tools.mount(&mapper_arg, &self.mount_path)?;
        self.state = MountState::Mounted;
        Ok(())
    }
}

impl CryptoManager for LuksCryptoManager {
    type Error = StoreError;

    fn set_encryption_key(&mut self, key: Key) {
        self.staged = Some(key);
    }

    fn setup_file_system(&mut self) -> StoreResult<()> {
        let key = self.staged_key()?;
        if self.state > MountState::Unmounted {
            self.unwind();
        }

        info!(
            "formatting encrypted store at {}",
            self.partition_path.display()
        );
        if let Err(err) = self.try_setup(&key) {
            error!("store setup failed: {err}");
            self.unwind();
            // a half-formatted partition must not look like a usable store
            if let Err(rm_err) = fs::remove_file(&self.partition_path) {
                if rm_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "failed to remove partial partition {}: {rm_err}",
                        self.partition_path.display()
                    );
                }
            }
            return Err(err);
        }
        info!("encrypted store mounted at {}", self.mount_path.display());
        Ok(())
    }

    fn mount_file_system(&mut self) -> StoreResult<()> {
        if self.state == MountState::Mounted {
            return Ok(());
        }
        if !self.file_system_is_setup() {
            return Err(StoreError::NotSetup);
        }
        let key = self.staged_key()?;
        if self.state > MountState::Unmounted {
            self.unwind();
        }

        if let Err(err) = self.try_mount(&key) {
            error!("store mount failed: {err}");
            self.unwind();
            return Err(err);
        }
        info!("encrypted store mounted at {}", self.mount_path.display());
        Ok(())
    }

    fn unmount_file_system(&mut self) -> StoreResult<()> {
        if self.state == MountState::Unmounted {
            return Ok(());
        }
        if self.unwind() {
            info!("encrypted store unmounted");
            Ok(())
        } else {
            Err(StoreError::Crypto(
                "one or more teardown steps failed; see log".into(),
            ))
        }
    }

    fn add_encryption_key(&mut self, key: &Key, existing: &Key) -> StoreResult<()> {
        let device = self.key_slot_device();
        if !self.cryptsetup.test_passphrase(&device, existing)? {
            return Err(StoreError::Crypto(
                "existing key does not unlock the store".into(),
            ));
        }
        self.cryptsetup.add_key(&device, key, existing)?;
        info!("key {} enrolled", key.fingerprint());
        Ok(())
    }

    fn remove_encryption_key(&mut self, key: &Key, remaining: &Key) -> StoreResult<()> {
        let device = self.key_slot_device();
        if !self.cryptsetup.test_passphrase(&device, remaining)? {
            return Err(StoreError::Crypto(
                "remaining key does not unlock the store".into(),
            ));
        }
        self.cryptsetup.remove_key(&device, key)?;
        info!("key {} removed from key ring", key.fingerprint());
        Ok(())
    }

    fn encryption_key_in_use(&mut self, key: &Key) -> bool {
        if self.state >= MountState::BlockEncryptionOpened {
            let device = self.key_slot_device();
            return self.cryptsetup.test_passphrase(&device, key).unwrap_or_else(|err| {
                warn!("key check failed: {err}");
                false
            });
        }

        if !self.file_system_is_setup() {
            return false;
        }

        // Probe by mounting; a successful probe leaves the store mounted.
        self.staged = Some(key.clone());
        match self.mount_file_system() {
            Ok(()) => true,
            Err(err) => {
                debug!("key probe mount failed: {err}");
                false
            }
        }
    }

    fn file_system_is_setup(&self) -> bool {
        self.partition_path.is_file()
    }

    fn file_system_is_mounted(&self) -> bool {
        self.state == MountState::Mounted
    }

    fn file_system_mount_path(&self) -> PathBuf {
        self.mount_path.clone()
    }

    fn backup_files(&self) -> Vec<PathBuf> {
        vec![self.partition_path.clone()]
    }
}

/// Mapper names may not contain arbitrary path characters.
fn mapping_name_for(storage_dir: &std::path::Path) -> String {
    let stem = storage_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let sanitized: String = stem
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    format!("credstore-{sanitized}")
}
