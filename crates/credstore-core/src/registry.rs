//! Name-to-constructor registry for the pluggable contracts.
//!
//! Extensions register a constructor under a name at startup; configuration
//! then selects implementations by name with no compile-time coupling
//! between the orchestrator and concrete plugins.

use crate::authorizer::DefaultKeyAuthorizer;
use crate::builtin::{DefaultAccessControlManager, DefaultCryptoManager, NullSecretsStorage};
use crate::config::{CredstoreConfig, DEFAULT_PLUGIN};
use crate::error::{StoreError, StoreResult};
use crate::storage::SqliteSecretsStorage;
use credstore_provider::{AccessControlManager, CryptoManager, KeyAuthorizer, SecretsStorage};
use log::debug;
use std::collections::HashMap;

pub type BoxedCryptoManager = Box<dyn CryptoManager<Error = StoreError>>;
pub type BoxedAuthorizer = Box<dyn KeyAuthorizer>;
pub type BoxedAccessControl = Box<dyn AccessControlManager>;
pub type BoxedSecretsStorage = Box<dyn SecretsStorage<Error = StoreError>>;

type Constructor<T> = Box<dyn Fn(&CredstoreConfig) -> StoreResult<T>>;

pub struct PluginRegistry {
    crypto_managers: HashMap<String, Constructor<BoxedCryptoManager>>,
    authorizers: HashMap<String, Constructor<BoxedAuthorizer>>,
    access_control: HashMap<String, Constructor<BoxedAccessControl>>,
    secrets_storage: HashMap<String, Constructor<BoxedSecretsStorage>>,
}

impl PluginRegistry {
    /// Registry pre-populated with the built-in implementations.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            crypto_managers: HashMap::new(),
            authorizers: HashMap::new(),
            access_control: HashMap::new(),
            secrets_storage: HashMap::new(),
        };

        registry.register_crypto_manager(DEFAULT_PLUGIN, |cfg| {
            Ok(Box::new(DefaultCryptoManager::from_config(cfg)?) as BoxedCryptoManager)
        });
        registry.register_authorizer(DEFAULT_PLUGIN, |_| {
            Ok(Box::new(DefaultKeyAuthorizer) as BoxedAuthorizer)
        });
        registry.register_access_control(DEFAULT_PLUGIN, |_| {
            Ok(Box::new(DefaultAccessControlManager) as BoxedAccessControl)
        });
        registry.register_secrets_storage(DEFAULT_PLUGIN, |_| {
            Ok(Box::new(NullSecretsStorage::default()) as BoxedSecretsStorage)
        });
        registry.register_secrets_storage("sqlite", |_| {
            Ok(Box::new(SqliteSecretsStorage::new()) as BoxedSecretsStorage)
        });

        registry
    }

    pub fn register_crypto_manager<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&CredstoreConfig) -> StoreResult<BoxedCryptoManager> + 'static,
    {
        self.crypto_managers
            .insert(name.to_string(), Box::new(constructor));
    }

    pub fn register_authorizer<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&CredstoreConfig) -> StoreResult<BoxedAuthorizer> + 'static,
    {
        self.authorizers
            .insert(name.to_string(), Box::new(constructor));
    }

    pub fn register_access_control<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&CredstoreConfig) -> StoreResult<BoxedAccessControl> + 'static,
    {
        self.access_control
            .insert(name.to_string(), Box::new(constructor));
    }

    pub fn register_secrets_storage<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&CredstoreConfig) -> StoreResult<BoxedSecretsStorage> + 'static,
    {
        self.secrets_storage
            .insert(name.to_string(), Box::new(constructor));
    }

    pub fn crypto_manager(
        &self,
        name: &str,
        config: &CredstoreConfig,
    ) -> StoreResult<BoxedCryptoManager> {
        debug!("constructing crypto manager `{name}`");
        self.crypto_managers
            .get(name)
            .ok_or_else(|| unknown("crypto manager", name))?(config)
    }

    pub fn authorizer(&self, name: &str, config: &CredstoreConfig) -> StoreResult<BoxedAuthorizer> {
        debug!("constructing key authorizer `{name}`");
        self.authorizers
            .get(name)
            .ok_or_else(|| unknown("key authorizer", name))?(config)
    }

    pub fn access_control(
        &self,
        name: &str,
        config: &CredstoreConfig,
    ) -> StoreResult<BoxedAccessControl> {
        debug!("constructing access control manager `{name}`");
        self.access_control
            .get(name)
            .ok_or_else(|| unknown("access control manager", name))?(config)
    }

    pub fn secrets_storage(
        &self,
        name: &str,
        config: &CredstoreConfig,
    ) -> StoreResult<BoxedSecretsStorage> {
        debug!("constructing secrets storage `{name}`");
        self.secrets_storage
            .get(name)
            .ok_or_else(|| unknown("secrets storage", name))?(config)
    }
}

fn unknown(kind: &'static str, name: &str) -> StoreError {
    StoreError::UnknownPlugin {
        kind,
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> (TempDir, CredstoreConfig) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = CredstoreConfig::default();
        cfg.storage.path = dir.path().to_string_lossy().into_owned();
        (dir, cfg)
    }

    #[test]
    fn builtins_resolve_by_name() {
        let registry = PluginRegistry::with_builtins();
        let (_dir, cfg) = test_config();
        assert!(registry.crypto_manager(DEFAULT_PLUGIN, &cfg).is_ok());
        assert!(registry.authorizer(DEFAULT_PLUGIN, &cfg).is_ok());
        assert!(registry.access_control(DEFAULT_PLUGIN, &cfg).is_ok());
        assert!(registry.secrets_storage("sqlite", &cfg).is_ok());
    }

    #[test]
    fn unknown_plugin_names_the_kind() {
        let registry = PluginRegistry::with_builtins();
        let (_dir, cfg) = test_config();
        match registry.crypto_manager("missing", &cfg) {
            Err(StoreError::UnknownPlugin { kind, name }) => {
                assert_eq!(kind, "crypto manager");
                assert_eq!(name, "missing");
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn late_registration_overrides_nothing_else() {
        let mut registry = PluginRegistry::with_builtins();
        registry.register_secrets_storage("null2", |_| {
            Ok(Box::new(NullSecretsStorage::default()) as BoxedSecretsStorage)
        });
        let (_dir, cfg) = test_config();
        assert!(registry.secrets_storage("null2", &cfg).is_ok());
        assert!(registry.secrets_storage(DEFAULT_PLUGIN, &cfg).is_ok());
    }
}
