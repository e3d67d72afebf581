//! Shared error type for the credstore workspace.
//!
//! Crypto manager failures are reported as values and logged at the key
//! handler; nothing in this core panics on a recoverable condition. Error
//! text never contains key material.

use std::path::PathBuf;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid key material at {path}: {reason}")]
    InvalidKey { path: PathBuf, reason: String },

    /// Resource exhaustion: fails the current mount/setup attempt without
    /// automatic retry.
    #[error("no free loop device available")]
    NoLoopDevice,

    #[error("crypto operation failed: {0}")]
    Crypto(String),

    #[error("encrypted file system is not set up")]
    NotSetup,

    #[error("{0} is already initialized")]
    AlreadyInitialized(&'static str),

    /// Rejected before any crypto manager call: a non-destructive add needs
    /// at least one working authorized key.
    #[error("no authorized key available to extend the key ring")]
    NoAuthorizedKeys,

    /// Rejected before any crypto manager call: removing the last key would
    /// lock the store forever.
    #[error("refusing to revoke the last authorized key")]
    LastAuthorizedKey,

    #[error("secrets storage failure: {0}")]
    Storage(String),

    #[error("unknown {kind} plugin `{name}`")]
    UnknownPlugin { kind: &'static str, name: String },

    #[error(transparent)]
    TomlParse(#[from] toml::de::Error),

    #[error(transparent)]
    TomlWrite(#[from] toml::ser::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}
