//! Configuration model and helpers used by credstore services.
//!
//! The typed sections load from TOML or YAML files; `apply_setting` exposes
//! the flat string-keyed dictionary surface the daemon receives from its
//! management interface.

use crate::error::{StoreError, StoreResult};
use directories_next::BaseDirs;
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/credstore.toml";

/// Backing partitions smaller than this are silently clamped up.
pub const MINIMUM_STORE_SIZE: u64 = 4 * 1024 * 1024;

const DEFAULT_STORE_SIZE: u64 = 16 * 1024 * 1024;
const PARTITION_FILE_NAME: &str = "secrets.partition";
const MOUNT_DIR_NAME: &str = "mnt";

/// Plugin name selecting the built-in no-op implementation.
pub const DEFAULT_PLUGIN: &str = "default";

/// Filesystem created inside the encrypted mapping. Closed set; anything
/// else fails that setting and leaves the default in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FileSystemType {
    #[default]
    Ext2,
    Ext3,
    Ext4,
}

impl FileSystemType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ext2" => Some(Self::Ext2),
            "ext3" => Some(Self::Ext3),
            "ext4" => Some(Self::Ext4),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
            Self::Ext4 => "ext4",
        }
    }

    /// Name of the mkfs helper for this filesystem.
    pub fn mkfs_binary(&self) -> &'static str {
        match self {
            Self::Ext2 => "mkfs.ext2",
            Self::Ext3 => "mkfs.ext3",
            Self::Ext4 => "mkfs.ext4",
        }
    }
}

impl fmt::Display for FileSystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the encrypted store lives and how big it is.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageCfg {
    #[serde(default = "default_storage_path")]
    pub path: String,

    #[serde(default = "default_store_size")]
    pub size: u64,

    #[serde(default)]
    pub file_system_type: FileSystemType,
}

fn default_storage_path() -> String {
    "/var/lib/credstore".to_string()
}

fn default_store_size() -> u64 {
    DEFAULT_STORE_SIZE
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            size: default_store_size(),
            file_system_type: FileSystemType::default(),
        }
    }
}

/// Plugin selection by name. `"default"` picks the built-in no-op
/// implementations.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PluginsCfg {
    #[serde(default = "default_plugin_name")]
    pub crypto_manager: String,

    #[serde(default = "default_plugin_name")]
    pub key_authorizer: String,

    #[serde(default = "default_plugin_name")]
    pub access_control_manager: String,

    #[serde(default = "default_plugin_name")]
    pub secrets_storage: String,
}

fn default_plugin_name() -> String {
    DEFAULT_PLUGIN.to_string()
}

impl Default for PluginsCfg {
    fn default() -> Self {
        Self {
            crypto_manager: default_plugin_name(),
            key_authorizer: default_plugin_name(),
            access_control_manager: default_plugin_name(),
            secrets_storage: default_plugin_name(),
        }
    }
}

/// Database locations. The metadata database lives outside the encrypted
/// store; the secrets database is a file name resolved against the mount
/// path once the store is available.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DatabaseCfg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_path: Option<String>,

    #[serde(default = "default_secrets_file")]
    pub secrets_file: String,
}

fn default_secrets_file() -> String {
    "secrets.db".to_string()
}

impl Default for DatabaseCfg {
    fn default() -> Self {
        Self {
            metadata_path: None,
            secrets_file: default_secrets_file(),
        }
    }
}

/// File-based key manager settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeysCfg {
    #[serde(default = "default_key_directory")]
    pub directory: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<String>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_key_directory() -> String {
    "/run/credstore/keys".to_string()
}

fn default_poll_interval_secs() -> u64 {
    2
}

impl Default for KeysCfg {
    fn default() -> Self {
        Self {
            directory: default_key_directory(),
            expected_sha256: None,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

/// Top-level configuration snapshot consumed by the credentials access
/// manager and the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CredstoreConfig {
    #[serde(default)]
    pub storage: StorageCfg,

    #[serde(default)]
    pub plugins: PluginsCfg,

    #[serde(default)]
    pub database: DatabaseCfg,

    #[serde(default)]
    pub keys: KeysCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    #[schemars(skip)]
    pub format: ConfigFormat,
}

impl CredstoreConfig {
    /// Read a config file from disk, detect format, and normalise values.
    pub fn load<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };
        cfg.normalize();
        Ok(cfg)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            warn!(
                "configuration missing at {}; using built-in defaults",
                path.display()
            );
            let mut cfg = Self::default();
            cfg.path = path.to_path_buf();
            cfg.normalize();
            Ok(cfg)
        }
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> StoreResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }

    /// Apply one entry of the flat string-keyed configuration dictionary.
    ///
    /// A rejected value fails only that setting; the previous (or default)
    /// value stays in place.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> StoreResult<()> {
        match key {
            "StoragePath" => {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(StoreError::InvalidConfig(
                        "StoragePath must not be empty".to_string(),
                    ));
                }
                self.storage.path = trimmed.to_string();
                Ok(())
            }
            "Size" => {
                let parsed: u64 = value.trim().parse().map_err(|_| {
                    StoreError::InvalidConfig(format!("Size `{value}` is not a byte count"))
                })?;
                self.storage.size = clamp_store_size(parsed);
                Ok(())
            }
            "FileSystemType" => match FileSystemType::parse(value) {
                Some(fs_type) => {
                    self.storage.file_system_type = fs_type;
                    Ok(())
                }
                None => Err(StoreError::InvalidConfig(format!(
                    "unsupported FileSystemType `{value}` (expected ext2, ext3, or ext4)"
                ))),
            },
            "CryptoManager" => {
                self.plugins.crypto_manager = value.trim().to_string();
                Ok(())
            }
            "KeyAuthorizer" => {
                self.plugins.key_authorizer = value.trim().to_string();
                Ok(())
            }
            "AccessControlManager" => {
                self.plugins.access_control_manager = value.trim().to_string();
                Ok(())
            }
            "SecretsStorage" => {
                self.plugins.secrets_storage = value.trim().to_string();
                Ok(())
            }
            other => Err(StoreError::InvalidConfig(format!(
                "unrecognised setting `{other}`"
            ))),
        }
    }

    /// Apply a whole dictionary, logging and skipping rejected entries.
    pub fn apply_settings<'a, I>(&mut self, settings: I) -> Vec<String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut issues = Vec::new();
        for (key, value) in settings {
            if let Err(err) = self.apply_setting(key, value) {
                warn!("ignoring setting {key}: {err}");
                issues.push(err.to_string());
            }
        }
        issues
    }

    /// Storage directory with `~` expanded.
    pub fn storage_dir(&self) -> PathBuf {
        expand_home(&self.storage.path)
    }

    /// Backing partition file for the encrypted store.
    pub fn partition_file(&self) -> PathBuf {
        self.storage_dir().join(PARTITION_FILE_NAME)
    }

    /// Where the decrypted filesystem gets mounted.
    pub fn mount_path(&self) -> PathBuf {
        self.storage_dir().join(MOUNT_DIR_NAME)
    }

    /// Metadata database path (outside the encrypted store).
    pub fn metadata_db_path(&self) -> PathBuf {
        match &self.database.metadata_path {
            Some(path) => expand_home(path),
            None => self.storage_dir().join("metadata.db"),
        }
    }

    /// Secrets database file name, resolved against the mounted store.
    pub fn secrets_db_file(&self) -> &str {
        &self.database.secrets_file
    }

    pub fn key_directory(&self) -> PathBuf {
        expand_home(&self.keys.directory)
    }

    /// Best-effort validation pass returning human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.storage.path.trim().is_empty() {
            issues.push("storage.path must not be empty".to_string());
        }
        if self.storage.size < MINIMUM_STORE_SIZE {
            issues.push(format!(
                "storage.size {} is below the {} byte minimum",
                self.storage.size, MINIMUM_STORE_SIZE
            ));
        }
        for (name, value) in [
            ("plugins.crypto_manager", &self.plugins.crypto_manager),
            ("plugins.key_authorizer", &self.plugins.key_authorizer),
            (
                "plugins.access_control_manager",
                &self.plugins.access_control_manager,
            ),
            ("plugins.secrets_storage", &self.plugins.secrets_storage),
        ] {
            if value.trim().is_empty() {
                issues.push(format!("{name} must not be empty"));
            }
        }
        if self.database.secrets_file.trim().is_empty()
            || self.database.secrets_file.contains('/')
        {
            issues.push("database.secrets_file must be a bare file name".to_string());
        }
        if let Some(expected) = &self.keys.expected_sha256 {
            if !expected.trim().is_empty()
                && (expected.len() != 64 || hex::decode(expected).is_err())
            {
                issues.push("keys.expected_sha256 must be a 64-character hex string".to_string());
            }
        }

        issues
    }

    fn normalize(&mut self) {
        self.storage.size = clamp_store_size(self.storage.size);
    }
}

fn clamp_store_size(size: u64) -> u64 {
    if size < MINIMUM_STORE_SIZE {
        warn!(
            "store size {size} below minimum; clamping to {}",
            MINIMUM_STORE_SIZE
        );
        MINIMUM_STORE_SIZE
    } else {
        size
    }
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        if let Some(dirs) = BaseDirs::new() {
            return dirs.home_dir().to_path_buf();
        }
    } else if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(dirs) = BaseDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_minimum_size_is_clamped() {
        let mut cfg = CredstoreConfig::default();
        cfg.apply_setting("Size", "1024").unwrap();
        assert_eq!(cfg.storage.size, MINIMUM_STORE_SIZE);

        cfg.apply_setting("Size", &(2 * MINIMUM_STORE_SIZE).to_string())
            .unwrap();
        assert_eq!(cfg.storage.size, 2 * MINIMUM_STORE_SIZE);
    }

    #[test]
    fn bad_file_system_type_leaves_default() {
        let mut cfg = CredstoreConfig::default();
        cfg.apply_setting("FileSystemType", "ext4").unwrap();
        assert_eq!(cfg.storage.file_system_type, FileSystemType::Ext4);

        let err = cfg.apply_setting("FileSystemType", "zfs").unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
        assert_eq!(cfg.storage.file_system_type, FileSystemType::Ext4);
    }

    #[test]
    fn apply_settings_collects_issues_and_continues() {
        let mut cfg = CredstoreConfig::default();
        let issues = cfg.apply_settings(vec![
            ("StoragePath", "/tmp/store"),
            ("FileSystemType", "ntfs"),
            ("CryptoManager", "luks"),
        ]);
        assert_eq!(issues.len(), 1);
        assert_eq!(cfg.storage.path, "/tmp/store");
        assert_eq!(cfg.plugins.crypto_manager, "luks");
    }

    #[test]
    fn tilde_expands_to_home() {
        let expanded = expand_home("~/secure");
        assert!(!expanded.starts_with("~"));
        assert!(expanded.ends_with("secure"));
    }

    #[test]
    fn derived_paths_hang_off_storage_dir() {
        let mut cfg = CredstoreConfig::default();
        cfg.storage.path = "/var/lib/credstore".to_string();
        assert_eq!(
            cfg.partition_file(),
            PathBuf::from("/var/lib/credstore/secrets.partition")
        );
        assert_eq!(cfg.mount_path(), PathBuf::from("/var/lib/credstore/mnt"));
        assert_eq!(
            cfg.metadata_db_path(),
            PathBuf::from("/var/lib/credstore/metadata.db")
        );
    }

    #[test]
    fn toml_round_trip_preserves_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credstore.toml");
        fs::write(
            &path,
            "[storage]\npath = \"/tmp/cred\"\nsize = 1024\nfile_system_type = \"ext4\"\n\n[plugins]\ncrypto_manager = \"luks\"\n",
        )
        .unwrap();

        let cfg = CredstoreConfig::load(&path).unwrap();
        assert_eq!(cfg.storage.path, "/tmp/cred");
        // normalisation clamps the undersized value at load time
        assert_eq!(cfg.storage.size, MINIMUM_STORE_SIZE);
        assert_eq!(cfg.storage.file_system_type, FileSystemType::Ext4);
        assert_eq!(cfg.plugins.crypto_manager, "luks");
        assert_eq!(cfg.plugins.secrets_storage, DEFAULT_PLUGIN);
    }
}
