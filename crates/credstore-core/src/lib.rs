//! Security core of the credstore daemon.
//!
//! Ties the pluggable contracts from `credstore-provider` together: key
//! tracking and authorization, encrypted store lifecycle, database
//! open/close in lockstep with mount state, and deferred answers for
//! callers that arrive before the store is up.

pub mod access_manager;
pub mod authorizer;
pub mod builtin;
pub mod config;
pub mod error;
pub mod key_handler;
pub mod keyfile;
pub mod logging;
pub mod registry;
pub mod storage;

pub use access_manager::{
    CredentialsAccessManager, PendingAuthorization, StoreAvailability, UnavailableReason,
};
pub use authorizer::DefaultKeyAuthorizer;
pub use config::{ConfigFormat, CredstoreConfig, FileSystemType, MINIMUM_STORE_SIZE};
pub use error::{StoreError, StoreResult};
pub use key_handler::{AuthorizeFlags, KeyDisableOutcome, KeyHandler, KeyInsertOutcome};
pub use registry::PluginRegistry;
pub use storage::SqliteSecretsStorage;
