//! Orchestration of credential store availability.
//!
//! The credentials access manager wires key events, authorization decisions,
//! mount transitions, and database lifecycles together. Callers that need
//! the store before it is available are parked in FIFO order and answered
//! exactly once when the store comes up or the attempt is abandoned.

use crate::config::CredstoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::key_handler::{AuthorizeFlags, KeyDisableOutcome, KeyHandler, KeyInsertOutcome};
use crate::registry::{BoxedAccessControl, BoxedAuthorizer, BoxedSecretsStorage, PluginRegistry};
use credstore_provider::{
    AuthorizationContext, AuthorizationReason, DecisionTicket, Key, KeyDecision, KeyEvent,
    KeyManagerEvent,
};
use log::{error, info, warn};
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Why a store-access request could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// An authorization decision denied the pending key, or the peer itself
    /// was rejected.
    Denied,
    /// The crypto manager failed to bring the store up.
    CryptoFailure,
    /// No authorized key is available to unlock the store.
    NoKeys,
}

/// Terminal answer to a store-access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAvailability {
    Available,
    Unavailable(UnavailableReason),
}

/// An authorization query in flight. The caller awaits the ticket and feeds
/// the decision back through
/// [`CredentialsAccessManager::handle_authorization_decision`].
pub struct PendingAuthorization {
    pub key: Key,
    pub ticket: DecisionTicket,
}

pub struct CredentialsAccessManager {
    config: CredstoreConfig,
    key_handler: KeyHandler,
    authorizer: BoxedAuthorizer,
    access_control: BoxedAccessControl,
    metadata_db: BoxedSecretsStorage,
    secrets_db: BoxedSecretsStorage,
    deferred: VecDeque<oneshot::Sender<StoreAvailability>>,
    store_was_mounted: bool,
    initialized: bool,
}

impl CredentialsAccessManager {
    /// Build the manager with plugins resolved from `config` by name.
    pub fn new(config: CredstoreConfig, registry: &PluginRegistry) -> StoreResult<Self> {
        let crypto = registry.crypto_manager(&config.plugins.crypto_manager, &config)?;
        let authorizer = registry.authorizer(&config.plugins.key_authorizer, &config)?;
        let access_control =
            registry.access_control(&config.plugins.access_control_manager, &config)?;
        let metadata_db = registry.secrets_storage(&config.plugins.secrets_storage, &config)?;
        let secrets_db = registry.secrets_storage(&config.plugins.secrets_storage, &config)?;
        Ok(Self::from_parts(
            config,
            KeyHandler::new(crypto),
            authorizer,
            access_control,
            metadata_db,
            secrets_db,
        ))
    }

    /// Assemble from already-constructed parts.
    pub fn from_parts(
        config: CredstoreConfig,
        key_handler: KeyHandler,
        authorizer: BoxedAuthorizer,
        access_control: BoxedAccessControl,
        metadata_db: BoxedSecretsStorage,
        secrets_db: BoxedSecretsStorage,
    ) -> Self {
        Self {
            config,
            key_handler,
            authorizer,
            access_control,
            metadata_db,
            secrets_db,
            deferred: VecDeque::new(),
            store_was_mounted: false,
            initialized: false,
        }
    }

    /// Open the metadata database and arm the key handler. Callable once.
    pub fn initialize<I, S>(&mut self, key_managers: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.initialized {
            return Err(StoreError::AlreadyInitialized("credentials access manager"));
        }
        std::fs::create_dir_all(self.config.storage_dir())?;
        let metadata_path = self.config.metadata_db_path();
        self.metadata_db.open(&metadata_path)?;
        self.key_handler.initialize(key_managers)?;
        self.initialized = true;
        info!("credentials access manager initialized");
        Ok(())
    }

    pub fn key_handler(&self) -> &KeyHandler {
        &self.key_handler
    }

    /// The store is available once the encrypted filesystem is mounted and
    /// the secrets database is open on it.
    pub fn is_store_available(&self) -> bool {
        self.key_handler.crypto().file_system_is_mounted() && self.secrets_db.is_open()
    }

    /// Feed one key manager event through the handler.
    ///
    /// Returns an authorization query when the event introduced a key that
    /// needs a decision.
    pub fn handle_key_event(
        &mut self,
        event: KeyManagerEvent,
    ) -> StoreResult<Option<PendingAuthorization>> {
        let was_ready = self.key_handler.is_ready();
        self.key_handler.note_manager_report(&event.manager);
        let reason = if was_ready {
            AuthorizationReason::KeyInserted
        } else {
            AuthorizationReason::SystemStarted
        };

        let pending = match event.event {
            KeyEvent::Inserted(key) => match self.key_handler.handle_key_inserted(&key) {
                KeyInsertOutcome::NoKeyReport | KeyInsertOutcome::AlreadyInserted => None,
                KeyInsertOutcome::AuthorizedKeyAvailable => {
                    if let Err(err) = self.key_handler.mount_with_authorized_key() {
                        error!("failed to mount store with authorized key: {err}");
                        self.drain_deferred(StoreAvailability::Unavailable(
                            UnavailableReason::CryptoFailure,
                        ));
                    }
                    None
                }
                KeyInsertOutcome::NeedsAuthorization => Some(self.query_authorization(key, reason)),
            },
            KeyEvent::Disabled(key) => {
                self.handle_key_unavailable(&key)?;
                None
            }
            KeyEvent::Removed(key) => {
                // Permanent removal: this key will never be offered again.
                info!("key {} permanently removed", key.fingerprint());
                self.handle_key_unavailable(&key)?;
                None
            }
        };

        self.sync_mount_status()?;
        Ok(pending)
    }

    /// Apply a policy decision for a previously queried key.
    pub fn handle_authorization_decision(
        &mut self,
        key: &Key,
        decision: KeyDecision,
    ) -> StoreResult<()> {
        match decision {
            KeyDecision::Denied => {
                info!("key {} denied", key.fingerprint());
                self.drain_deferred(StoreAvailability::Unavailable(UnavailableReason::Denied));
            }
            KeyDecision::Approved => {
                if let Err(err) = self
                    .key_handler
                    .authorize_key(key, AuthorizeFlags::default())
                {
                    error!("failed to authorize key {}: {err}", key.fingerprint());
                    self.drain_deferred(StoreAvailability::Unavailable(
                        UnavailableReason::CryptoFailure,
                    ));
                    return Err(err);
                }
                if let Err(err) = self.key_handler.mount_with_authorized_key() {
                    error!("failed to mount store: {err}");
                    self.drain_deferred(StoreAvailability::Unavailable(
                        UnavailableReason::CryptoFailure,
                    ));
                    return Err(err);
                }
            }
            KeyDecision::Exclusive => {
                warn!(
                    "reformatting store for exclusive key {}",
                    key.fingerprint()
                );
                self.close_secrets_db();
                // the reformat replaces the filesystem underneath us; treat
                // whatever follows as a fresh mount transition
                self.store_was_mounted = false;
                if let Err(err) = self
                    .key_handler
                    .authorize_key(key, AuthorizeFlags { reformat: true })
                {
                    error!("failed to reformat store: {err}");
                    self.drain_deferred(StoreAvailability::Unavailable(
                        UnavailableReason::CryptoFailure,
                    ));
                    return Err(err);
                }
            }
        }

        self.sync_mount_status()
    }

    /// Ask for the credential store on behalf of `peer`.
    ///
    /// The receiver resolves exactly once: immediately when the answer is
    /// already known, otherwise when a later mount transition or abandoned
    /// authorization settles it. A `StorageNeeded` authorization query is
    /// returned when an inserted but unauthorized key could still unlock
    /// things.
    pub fn request_store_access(
        &mut self,
        peer: &str,
    ) -> (
        oneshot::Receiver<StoreAvailability>,
        Option<PendingAuthorization>,
    ) {
        let (tx, rx) = oneshot::channel();

        if !self.access_control.is_peer_allowed(peer, "request_store_access") {
            warn!("peer {peer} denied store access");
            let _ = tx.send(StoreAvailability::Unavailable(UnavailableReason::Denied));
            return (rx, None);
        }

        if self.is_store_available() {
            let _ = tx.send(StoreAvailability::Available);
            return (rx, None);
        }

        info!("store not yet available; deferring request from {peer}");
        self.deferred.push_back(tx);

        // A parked caller is a reason to re-ask about a key that was left
        // undecided or arrived before anyone needed the store.
        let candidate = self
            .key_handler
            .inserted_keys()
            .iter()
            .find(|k| !self.key_handler.is_key_authorized(k))
            .cloned();
        let pending = candidate
            .map(|key| self.query_authorization(key, AuthorizationReason::StorageNeeded));

        (rx, pending)
    }

    /// Reconcile database state with the mount state, answering deferred
    /// callers on an upward transition.
    pub fn sync_mount_status(&mut self) -> StoreResult<()> {
        let mounted = self.key_handler.crypto().file_system_is_mounted();
        if mounted == self.store_was_mounted {
            return Ok(());
        }
        self.store_was_mounted = mounted;

        if mounted {
            let path = self
                .key_handler
                .crypto()
                .file_system_mount_path()
                .join(self.config.secrets_db_file());
            match self.secrets_db.open(&path) {
                Ok(()) => {
                    info!("credential store available");
                    self.drain_deferred(StoreAvailability::Available);
                }
                Err(err) => {
                    error!("failed to open secrets database: {err}");
                    self.drain_deferred(StoreAvailability::Unavailable(
                        UnavailableReason::CryptoFailure,
                    ));
                    return Err(err);
                }
            }
        } else {
            info!("credential store unavailable");
            self.close_secrets_db();
        }
        Ok(())
    }

    /// Close databases and unmount, in that order.
    pub fn shutdown(&mut self) -> StoreResult<()> {
        self.close_secrets_db();
        if let Err(err) = self.metadata_db.close() {
            warn!("failed to close metadata database: {err}");
        }
        if self.key_handler.crypto().file_system_is_mounted() {
            self.key_handler.crypto_mut().unmount_file_system()?;
        }
        self.store_was_mounted = false;
        self.drain_deferred(StoreAvailability::Unavailable(UnavailableReason::NoKeys));
        info!("credentials access manager shut down");
        Ok(())
    }

    /// Paths a backup job must copy while the store is unmounted.
    pub fn backup_files(&self) -> Vec<std::path::PathBuf> {
        let mut files = self.key_handler.crypto().backup_files();
        files.push(self.config.metadata_db_path());
        files
    }

    fn query_authorization(&mut self, key: Key, reason: AuthorizationReason) -> PendingAuthorization {
        let ctx = AuthorizationContext {
            store_is_setup: self.key_handler.crypto().file_system_is_setup(),
            has_authorized_keys: !self.key_handler.authorized_keys().is_empty(),
        };
        info!(
            "querying authorization for key {} ({reason:?})",
            key.fingerprint()
        );
        let ticket = self.authorizer.query_key_authorization(&key, reason, ctx);
        PendingAuthorization { key, ticket }
    }

    fn handle_key_unavailable(&mut self, key: &Key) -> StoreResult<()> {
        if self.key_handler.handle_key_disabled(key) == KeyDisableOutcome::LastAuthorizedGone {
            warn!("locking down credential store");
            self.lock_down()?;
        }
        Ok(())
    }

    fn lock_down(&mut self) -> StoreResult<()> {
        self.close_secrets_db();
        if self.key_handler.crypto().file_system_is_mounted() {
            self.key_handler.crypto_mut().unmount_file_system()?;
        }
        self.sync_mount_status()
    }

    fn close_secrets_db(&mut self) {
        if self.secrets_db.is_open() {
            if let Err(err) = self.secrets_db.close() {
                warn!("failed to close secrets database: {err}");
            }
        }
    }

    fn drain_deferred(&mut self, answer: StoreAvailability) {
        for tx in self.deferred.drain(..) {
            let _ = tx.send(answer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorizer::DefaultKeyAuthorizer;
    use crate::builtin::{DefaultAccessControlManager, DefaultCryptoManager, NullSecretsStorage};
    use crate::key_handler::fake::FakeCryptoManager;
    use credstore_provider::AccessControlManager;
    use tempfile::TempDir;

    struct DenyAll;

    impl AccessControlManager for DenyAll {
        fn is_peer_allowed(&self, _peer: &str, _method: &str) -> bool {
            false
        }
    }

    fn manager_with(fake: FakeCryptoManager) -> (TempDir, CredentialsAccessManager) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CredstoreConfig::default();
        config.storage.path = dir.path().to_string_lossy().into_owned();
        let mut cam = CredentialsAccessManager::from_parts(
            config,
            KeyHandler::new(Box::new(fake)),
            Box::new(DefaultKeyAuthorizer),
            Box::new(DefaultAccessControlManager),
            Box::new(NullSecretsStorage::default()),
            Box::new(NullSecretsStorage::default()),
        );
        cam.initialize(["file"]).unwrap();
        (dir, cam)
    }

    fn inserted(key: &Key) -> KeyManagerEvent {
        KeyManagerEvent {
            manager: "file".to_string(),
            event: KeyEvent::Inserted(key.clone()),
        }
    }

    fn disabled(key: &Key) -> KeyManagerEvent {
        KeyManagerEvent {
            manager: "file".to_string(),
            event: KeyEvent::Disabled(key.clone()),
        }
    }

    fn removed(key: &Key) -> KeyManagerEvent {
        KeyManagerEvent {
            manager: "file".to_string(),
            event: KeyEvent::Removed(key.clone()),
        }
    }

    fn decide(cam: &mut CredentialsAccessManager, pending: PendingAuthorization) {
        let PendingAuthorization { key, mut ticket } = pending;
        let decision = ticket.try_decision().expect("policy should have answered");
        cam.handle_authorization_decision(&key, decision).unwrap();
    }

    #[test]
    fn default_crypto_manager_serves_without_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CredstoreConfig::default();
        config.storage.path = dir.path().to_string_lossy().into_owned();
        let crypto = DefaultCryptoManager::from_config(&config).unwrap();
        let mut cam = CredentialsAccessManager::from_parts(
            config,
            KeyHandler::new(Box::new(crypto)),
            Box::new(DefaultKeyAuthorizer),
            Box::new(DefaultAccessControlManager),
            Box::new(NullSecretsStorage::default()),
            Box::new(NullSecretsStorage::default()),
        );
        cam.initialize(["file"]).unwrap();
        cam.sync_mount_status().unwrap();
        assert!(cam.is_store_available());

        let (mut rx, pending) = cam.request_store_access("app");
        assert!(pending.is_none());
        assert_eq!(rx.try_recv().unwrap(), StoreAvailability::Available);
    }

    #[test]
    fn fresh_key_formats_and_opens_the_store() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        let key = Key::from("alpha");

        let pending = cam.handle_key_event(inserted(&key)).unwrap();
        let pending = pending.expect("new key needs a decision");
        decide(&mut cam, pending);

        assert!(cam.is_store_available());
        assert!(cam.key_handler().is_key_authorized(&key));
    }

    #[test]
    fn deferred_caller_is_answered_exactly_once_on_mount() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        let (mut rx, pending) = cam.request_store_access("app");
        assert!(rx.try_recv().is_err());
        assert!(pending.is_none(), "no key inserted yet, nothing to re-query");

        let key = Key::from("alpha");
        let pending = cam.handle_key_event(inserted(&key)).unwrap().unwrap();
        decide(&mut cam, pending);

        assert_eq!(rx.try_recv().unwrap(), StoreAvailability::Available);
        // resolved senders are gone; a second transition cannot answer again
        assert!(cam.deferred.is_empty());
    }

    #[test]
    fn request_after_availability_resolves_immediately() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        let key = Key::from("alpha");
        let pending = cam.handle_key_event(inserted(&key)).unwrap().unwrap();
        decide(&mut cam, pending);

        let (mut rx, pending) = cam.request_store_access("app");
        assert!(pending.is_none());
        assert_eq!(rx.try_recv().unwrap(), StoreAvailability::Available);
    }

    #[test]
    fn denied_decision_drains_deferred_callers() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        let (mut rx, _) = cam.request_store_access("app");

        let key = Key::from("alpha");
        let pending = cam.handle_key_event(inserted(&key)).unwrap().unwrap();
        cam.handle_authorization_decision(&pending.key, KeyDecision::Denied)
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            StoreAvailability::Unavailable(UnavailableReason::Denied)
        );
        assert!(!cam.is_store_available());
    }

    #[test]
    fn disallowed_peer_is_rejected_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CredstoreConfig::default();
        config.storage.path = dir.path().to_string_lossy().into_owned();
        let mut cam = CredentialsAccessManager::from_parts(
            config,
            KeyHandler::new(Box::new(FakeCryptoManager::new())),
            Box::new(DefaultKeyAuthorizer),
            Box::new(DenyAll),
            Box::new(NullSecretsStorage::default()),
            Box::new(NullSecretsStorage::default()),
        );
        cam.initialize(["file"]).unwrap();

        let (mut rx, pending) = cam.request_store_access("rogue");
        assert!(pending.is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreAvailability::Unavailable(UnavailableReason::Denied)
        );
    }

    #[test]
    fn losing_last_authorized_key_locks_the_store() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        let key = Key::from("alpha");
        let pending = cam.handle_key_event(inserted(&key)).unwrap().unwrap();
        decide(&mut cam, pending);
        assert!(cam.is_store_available());

        cam.handle_key_event(disabled(&key)).unwrap();
        assert!(!cam.is_store_available());
        assert!(!cam.key_handler().crypto().file_system_is_mounted());
        // authorization is not revoked by physical removal
        assert!(cam.key_handler().is_key_authorized(&key));
    }

    #[test]
    fn removing_last_authorized_key_locks_the_store() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        let key = Key::from("alpha");
        let pending = cam.handle_key_event(inserted(&key)).unwrap().unwrap();
        decide(&mut cam, pending);
        assert!(cam.is_store_available());

        cam.handle_key_event(removed(&key)).unwrap();
        assert!(!cam.is_store_available());
        assert!(!cam.key_handler().is_key_inserted(&key));
    }

    #[test]
    fn reinserting_authorized_key_reopens_the_store() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        let key = Key::from("alpha");
        let pending = cam.handle_key_event(inserted(&key)).unwrap().unwrap();
        decide(&mut cam, pending);
        cam.handle_key_event(disabled(&key)).unwrap();
        assert!(!cam.is_store_available());

        let pending = cam.handle_key_event(inserted(&key)).unwrap();
        assert!(pending.is_none(), "authorized key needs no new decision");
        assert!(cam.is_store_available());
    }

    #[test]
    fn storage_needed_requery_for_undecided_key() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        let key = Key::from("alpha");
        // key arrives but its decision is dropped (policy abandoned it)
        let _abandoned = cam.handle_key_event(inserted(&key)).unwrap().unwrap();

        let (_rx, pending) = cam.request_store_access("app");
        let pending = pending.expect("parked caller should trigger a re-query");
        assert_eq!(pending.key, key);
        decide(&mut cam, pending);
        assert!(cam.is_store_available());
    }

    #[test]
    fn exclusive_decision_while_mounted_reopens_fresh_store() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        let alpha = Key::from("alpha");
        let pending = cam.handle_key_event(inserted(&alpha)).unwrap().unwrap();
        decide(&mut cam, pending);
        assert!(cam.is_store_available());

        let beta = Key::from("beta");
        let pending = cam.handle_key_event(inserted(&beta)).unwrap().unwrap();
        cam.handle_authorization_decision(&pending.key, KeyDecision::Exclusive)
            .unwrap();

        assert!(cam.is_store_available());
        assert!(cam.key_handler().is_key_authorized(&beta));
        assert!(!cam.key_handler().is_key_authorized(&alpha));
    }

    #[test]
    fn shutdown_answers_parked_callers() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        let (mut rx, _) = cam.request_store_access("app");
        cam.shutdown().unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreAvailability::Unavailable(UnavailableReason::NoKeys)
        );
    }

    #[test]
    fn initialize_twice_is_rejected() {
        let (_dir, mut cam) = manager_with(FakeCryptoManager::new());
        assert!(matches!(
            cam.initialize(["file"]),
            Err(StoreError::AlreadyInitialized(_))
        ));
    }
}
