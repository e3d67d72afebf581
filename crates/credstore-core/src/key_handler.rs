//! Tracking of inserted and authorized keys, and the bridge between
//! authorization decisions and the crypto manager.
//!
//! Two key sets are maintained: keys currently offered by some key manager
//! (inserted) and keys allowed to unlock the store (authorized). The handler
//! owns the crypto manager; all key-ring mutations funnel through here so
//! invariants like "never remove the last key slot" hold in one place.

use crate::error::{StoreError, StoreResult};
use credstore_provider::{CryptoManager, Key};
use log::{debug, info, warn};
use std::collections::HashSet;

/// What the handler concluded about a newly reported key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInsertOutcome {
    /// Empty key: the manager has nothing to offer. Counts toward readiness
    /// only.
    NoKeyReport,
    /// Key was already in the inserted set.
    AlreadyInserted,
    /// An already-authorized key became available; the store can be mounted
    /// with it.
    AuthorizedKeyAvailable,
    /// Unknown key; an authorization decision is needed.
    NeedsAuthorization,
}

/// What the handler concluded about a disabled or removed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDisableOutcome {
    /// The key was not in the inserted set.
    NotInserted,
    /// Removed from the inserted set; other authorized keys remain inserted
    /// (or the key was never authorized).
    Disabled,
    /// Removed from the inserted set and no inserted key is authorized any
    /// more. The store should be locked down.
    LastAuthorizedGone,
}

/// Options for [`KeyHandler::authorize_key`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorizeFlags {
    /// Reformat the store so the new key becomes its only key. Destroys any
    /// existing secrets.
    pub reformat: bool,
}

pub struct KeyHandler {
    crypto: Box<dyn CryptoManager<Error = StoreError>>,
    inserted: Vec<Key>,
    authorized: Vec<Key>,
    pending_reports: HashSet<String>,
    initialized: bool,
}

impl KeyHandler {
    pub fn new(crypto: Box<dyn CryptoManager<Error = StoreError>>) -> Self {
        Self {
            crypto,
            inserted: Vec::new(),
            authorized: Vec::new(),
            pending_reports: HashSet::new(),
            initialized: false,
        }
    }

    /// Record the set of key managers whose first report readiness waits
    /// for. Callable exactly once.
    pub fn initialize<I, S>(&mut self, managers: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.initialized {
            return Err(StoreError::AlreadyInitialized("key handler"));
        }
        self.pending_reports = managers.into_iter().map(Into::into).collect();
        self.initialized = true;
        info!(
            "key handler waiting on first report from {} manager(s)",
            self.pending_reports.len()
        );
        Ok(())
    }

    /// Ready once every registered manager has reported at least once.
    pub fn is_ready(&self) -> bool {
        self.initialized && self.pending_reports.is_empty()
    }

    /// Mark `manager` as having reported. Returns true if this report made
    /// the handler ready.
    pub fn note_manager_report(&mut self, manager: &str) -> bool {
        let was_ready = self.is_ready();
        self.pending_reports.remove(manager);
        let ready = self.is_ready();
        if ready && !was_ready {
            info!("all key managers reported; key handler ready");
        }
        ready && !was_ready
    }

    pub fn crypto(&self) -> &dyn CryptoManager<Error = StoreError> {
        self.crypto.as_ref()
    }

    pub fn crypto_mut(&mut self) -> &mut dyn CryptoManager<Error = StoreError> {
        self.crypto.as_mut()
    }

    pub fn inserted_keys(&self) -> &[Key] {
        &self.inserted
    }

    pub fn authorized_keys(&self) -> &[Key] {
        &self.authorized
    }

    pub fn is_key_inserted(&self, key: &Key) -> bool {
        self.inserted.contains(key)
    }

    pub fn is_key_authorized(&self, key: &Key) -> bool {
        self.authorized.contains(key)
    }

    /// A non-destructive authorization is possible only against an existing
    /// store with at least one authorized key to authenticate with.
    pub fn can_add_key_authorization(&self) -> bool {
        self.crypto.file_system_is_setup() && !self.authorized.is_empty()
    }

    /// Classify a key reported as inserted and update the inserted set.
    pub fn handle_key_inserted(&mut self, key: &Key) -> KeyInsertOutcome {
        if key.is_empty() {
            debug!("key manager reported no keys");
            return KeyInsertOutcome::NoKeyReport;
        }
        if self.inserted.contains(key) {
            return KeyInsertOutcome::AlreadyInserted;
        }
        self.inserted.push(key.clone());
        if self.is_key_authorized(key) {
            info!("authorized key {} inserted", key.fingerprint());
            return KeyInsertOutcome::AuthorizedKeyAvailable;
        }
        // A key that already opens an existing store needs no policy
        // decision. The check mounts the store as a side effect.
        if self.crypto.file_system_is_setup() && self.crypto.encryption_key_in_use(key) {
            self.authorized.push(key.clone());
            info!(
                "key {} unlocks the existing store; authorized",
                key.fingerprint()
            );
            return KeyInsertOutcome::AuthorizedKeyAvailable;
        }
        info!("unauthorized key {} inserted", key.fingerprint());
        KeyInsertOutcome::NeedsAuthorization
    }

    /// Remove a key from the inserted set. The authorized set is untouched;
    /// physically removing a key does not revoke it.
    pub fn handle_key_disabled(&mut self, key: &Key) -> KeyDisableOutcome {
        let Some(pos) = self.inserted.iter().position(|k| k == key) else {
            return KeyDisableOutcome::NotInserted;
        };
        self.inserted.remove(pos);

        if self.is_key_authorized(key)
            && !self.inserted.iter().any(|k| self.authorized.contains(k))
        {
            warn!(
                "last inserted authorized key {} disabled",
                key.fingerprint()
            );
            KeyDisableOutcome::LastAuthorizedGone
        } else {
            debug!("key {} disabled", key.fingerprint());
            KeyDisableOutcome::Disabled
        }
    }

    /// Make `key` an authorized key of the store.
    ///
    /// With `reformat` set, or when no store exists yet, the store is
    /// (re)created with `key` as its only key and every previous
    /// authorization is dropped. Otherwise the key is added alongside the
    /// existing keys, authenticated by a currently usable authorized key.
    pub fn authorize_key(&mut self, key: &Key, flags: AuthorizeFlags) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::Crypto("cannot authorize an empty key".into()));
        }

        if flags.reformat || !self.crypto.file_system_is_setup() {
            info!(
                "formatting store with key {} as its only key",
                key.fingerprint()
            );
            self.crypto.set_encryption_key(key.clone());
            self.crypto.setup_file_system()?;
            self.authorized.clear();
            self.authorized.push(key.clone());
            return Ok(());
        }

        if self.is_key_authorized(key) {
            debug!("key {} already authorized", key.fingerprint());
            return Ok(());
        }

        let existing = self.usable_authorized_key()?;
        self.crypto.add_encryption_key(key, &existing)?;
        self.authorized.push(key.clone());
        info!("key {} authorized", key.fingerprint());
        Ok(())
    }

    /// Drop `key` from the authorized set and from the store's key ring.
    pub fn revoke_key_authorization(&mut self, key: &Key) -> StoreResult<()> {
        if !self.crypto.file_system_is_setup() {
            return Err(StoreError::NotSetup);
        }
        let Some(pos) = self.authorized.iter().position(|k| k == key) else {
            debug!("key {} was not authorized", key.fingerprint());
            return Ok(());
        };
        if self.authorized.len() == 1 {
            return Err(StoreError::LastAuthorizedKey);
        }

        // The remaining key must actually unlock the store before the slot
        // change; probing mounts the store if it is not mounted yet.
        let remaining = self.usable_remaining_key(key)?;
        self.crypto.remove_encryption_key(key, &remaining)?;
        self.authorized.remove(pos);
        info!("key {} authorization revoked", key.fingerprint());
        Ok(())
    }

    /// Mount the store with an inserted authorized key.
    pub fn mount_with_authorized_key(&mut self) -> StoreResult<()> {
        if self.crypto.file_system_is_mounted() {
            return Ok(());
        }
        let key = self.usable_authorized_key()?;
        self.crypto.set_encryption_key(key);
        if self.crypto.file_system_is_mounted() {
            // usable_authorized_key probes by mounting; nothing left to do.
            return Ok(());
        }
        self.crypto.mount_file_system()
    }

    /// Find an inserted, authorized key that actually unlocks the store.
    ///
    /// The underlying check may mount the store as a side effect when it is
    /// not already mounted.
    fn usable_authorized_key(&mut self) -> StoreResult<Key> {
        let candidates: Vec<Key> = self
            .authorized
            .iter()
            .filter(|k| self.inserted.contains(*k))
            .cloned()
            .collect();
        self.probe_candidates(candidates)
    }

    /// Find an authorized key other than `revoked` that unlocks the store,
    /// preferring inserted keys. Revocation may authenticate with the
    /// retained bytes of a key that is not inserted right now.
    fn usable_remaining_key(&mut self, revoked: &Key) -> StoreResult<Key> {
        let mut candidates: Vec<Key> = self
            .authorized
            .iter()
            .filter(|k| *k != revoked && self.inserted.contains(*k))
            .cloned()
            .collect();
        candidates.extend(
            self.authorized
                .iter()
                .filter(|k| *k != revoked && !self.inserted.contains(*k))
                .cloned(),
        );
        self.probe_candidates(candidates)
    }

    fn probe_candidates(&mut self, candidates: Vec<Key>) -> StoreResult<Key> {
        for key in candidates {
            if self.crypto.encryption_key_in_use(&key) {
                return Ok(key);
            }
            warn!(
                "authorized key {} no longer unlocks the store",
                key.fingerprint()
            );
        }
        Err(StoreError::NoAuthorizedKeys)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::path::PathBuf;

    /// Crypto manager double keeping a key-slot ledger in memory.
    pub struct FakeCryptoManager {
        pub staged: Option<Key>,
        pub slots: Vec<Key>,
        pub setup: bool,
        pub mounted: bool,
        pub fail_setup: bool,
        pub fail_mount: bool,
        pub mount_calls: usize,
        pub unmount_calls: usize,
    }

    impl FakeCryptoManager {
        pub fn new() -> Self {
            Self {
                staged: None,
                slots: Vec::new(),
                setup: false,
                mounted: false,
                fail_setup: false,
                fail_mount: false,
                mount_calls: 0,
                unmount_calls: 0,
            }
        }

        pub fn with_existing_store(slots: Vec<Key>) -> Self {
            let mut fake = Self::new();
            fake.slots = slots;
            fake.setup = true;
            fake
        }
    }

    impl CryptoManager for FakeCryptoManager {
        type Error = StoreError;

        fn set_encryption_key(&mut self, key: Key) {
            self.staged = Some(key);
        }

        fn setup_file_system(&mut self) -> StoreResult<()> {
            if self.fail_setup {
                return Err(StoreError::Crypto("format failed".into()));
            }
            let staged = self
                .staged
                .clone()
                .ok_or_else(|| StoreError::Crypto("no key staged".into()))?;
            self.slots = vec![staged];
            self.setup = true;
            self.mounted = true;
            Ok(())
        }

        fn mount_file_system(&mut self) -> StoreResult<()> {
            self.mount_calls += 1;
            if self.fail_mount {
                return Err(StoreError::Crypto("mount failed".into()));
            }
            let staged = self
                .staged
                .clone()
                .ok_or_else(|| StoreError::Crypto("no key staged".into()))?;
            if !self.setup {
                return Err(StoreError::NotSetup);
            }
            if !self.slots.contains(&staged) {
                return Err(StoreError::Crypto("key does not unlock store".into()));
            }
            self.mounted = true;
            Ok(())
        }

        fn unmount_file_system(&mut self) -> StoreResult<()> {
            self.unmount_calls += 1;
            self.mounted = false;
            Ok(())
        }

        fn add_encryption_key(&mut self, key: &Key, existing: &Key) -> StoreResult<()> {
            if !self.slots.contains(existing) {
                return Err(StoreError::Crypto("bad existing key".into()));
            }
            if !self.slots.contains(key) {
                self.slots.push(key.clone());
            }
            Ok(())
        }

        fn remove_encryption_key(&mut self, key: &Key, remaining: &Key) -> StoreResult<()> {
            if !self.slots.contains(remaining) {
                return Err(StoreError::Crypto("bad remaining key".into()));
            }
            self.slots.retain(|k| k != key);
            Ok(())
        }

        fn encryption_key_in_use(&mut self, key: &Key) -> bool {
            if self.mounted {
                return self.slots.contains(key);
            }
            if self.setup && self.slots.contains(key) {
                self.staged = Some(key.clone());
                self.mounted = true;
                self.mount_calls += 1;
                return true;
            }
            false
        }

        fn file_system_is_setup(&self) -> bool {
            self.setup
        }

        fn file_system_is_mounted(&self) -> bool {
            self.mounted
        }

        fn file_system_mount_path(&self) -> PathBuf {
            PathBuf::from("/tmp/fake-store/mnt")
        }

        fn backup_files(&self) -> Vec<PathBuf> {
            vec![PathBuf::from("/tmp/fake-store/secrets.partition")]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeCryptoManager;
    use super::*;

    fn handler(fake: FakeCryptoManager) -> KeyHandler {
        let mut handler = KeyHandler::new(Box::new(fake));
        handler.initialize(["file"]).unwrap();
        handler
    }

    #[test]
    fn initialize_twice_is_rejected() {
        let mut h = handler(FakeCryptoManager::new());
        assert!(matches!(
            h.initialize(["file"]),
            Err(StoreError::AlreadyInitialized("key handler"))
        ));
    }

    #[test]
    fn readiness_waits_for_every_manager() {
        let mut h = KeyHandler::new(Box::new(FakeCryptoManager::new()));
        h.initialize(["file", "usb"]).unwrap();
        assert!(!h.is_ready());
        assert!(!h.note_manager_report("file"));
        assert!(h.note_manager_report("usb"));
        assert!(h.is_ready());
        // repeat reports do not re-trigger readiness
        assert!(!h.note_manager_report("usb"));
    }

    #[test]
    fn empty_key_counts_only_toward_readiness() {
        let mut h = handler(FakeCryptoManager::new());
        assert_eq!(
            h.handle_key_inserted(&Key::empty()),
            KeyInsertOutcome::NoKeyReport
        );
        assert!(h.inserted_keys().is_empty());
    }

    #[test]
    fn duplicate_insert_is_flagged() {
        let mut h = handler(FakeCryptoManager::new());
        let key = Key::from("alpha");
        assert_eq!(
            h.handle_key_inserted(&key),
            KeyInsertOutcome::NeedsAuthorization
        );
        assert_eq!(h.handle_key_inserted(&key), KeyInsertOutcome::AlreadyInserted);
        assert_eq!(h.inserted_keys().len(), 1);
    }

    #[test]
    fn first_authorization_formats_the_store() {
        let mut h = handler(FakeCryptoManager::new());
        let key = Key::from("alpha");
        h.handle_key_inserted(&key);
        assert!(!h.can_add_key_authorization());
        h.authorize_key(&key, AuthorizeFlags::default()).unwrap();
        assert!(h.crypto().file_system_is_setup());
        assert!(h.is_key_authorized(&key));
        assert_eq!(h.authorized_keys().len(), 1);
        assert!(h.can_add_key_authorization());
    }

    #[test]
    fn reformat_drops_previous_authorizations() {
        let mut h = handler(FakeCryptoManager::new());
        let alpha = Key::from("alpha");
        let beta = Key::from("beta");
        h.handle_key_inserted(&alpha);
        h.authorize_key(&alpha, AuthorizeFlags::default()).unwrap();
        h.handle_key_inserted(&beta);
        h.authorize_key(&beta, AuthorizeFlags { reformat: true })
            .unwrap();
        assert!(!h.is_key_authorized(&alpha));
        assert!(h.is_key_authorized(&beta));
        assert_eq!(h.authorized_keys().len(), 1);
    }

    #[test]
    fn additive_authorization_extends_the_key_ring() {
        let mut h = handler(FakeCryptoManager::new());
        let alpha = Key::from("alpha");
        let beta = Key::from("beta");
        h.handle_key_inserted(&alpha);
        h.authorize_key(&alpha, AuthorizeFlags::default()).unwrap();
        h.handle_key_inserted(&beta);
        h.authorize_key(&beta, AuthorizeFlags::default()).unwrap();
        assert!(h.is_key_authorized(&alpha));
        assert!(h.is_key_authorized(&beta));
    }

    #[test]
    fn additive_authorization_without_usable_key_fails() {
        // Store exists but none of its keys are inserted.
        let fake = FakeCryptoManager::with_existing_store(vec![Key::from("other")]);
        let mut h = handler(fake);
        // seed an authorized key that is not inserted
        h.authorized.push(Key::from("other"));
        let beta = Key::from("beta");
        h.handle_key_inserted(&beta);
        let err = h.authorize_key(&beta, AuthorizeFlags::default()).unwrap_err();
        assert!(matches!(err, StoreError::NoAuthorizedKeys));
        assert!(!h.is_key_authorized(&beta));
    }

    #[test]
    fn revoking_last_key_is_refused() {
        let mut h = handler(FakeCryptoManager::new());
        let alpha = Key::from("alpha");
        h.handle_key_inserted(&alpha);
        h.authorize_key(&alpha, AuthorizeFlags::default()).unwrap();
        assert!(matches!(
            h.revoke_key_authorization(&alpha),
            Err(StoreError::LastAuthorizedKey)
        ));
        assert!(h.is_key_authorized(&alpha));
    }

    #[test]
    fn revoke_removes_slot_and_authorization() {
        let mut h = handler(FakeCryptoManager::new());
        let alpha = Key::from("alpha");
        let beta = Key::from("beta");
        h.handle_key_inserted(&alpha);
        h.authorize_key(&alpha, AuthorizeFlags::default()).unwrap();
        h.handle_key_inserted(&beta);
        h.authorize_key(&beta, AuthorizeFlags::default()).unwrap();

        h.revoke_key_authorization(&beta).unwrap();
        assert!(!h.is_key_authorized(&beta));
        assert!(h.is_key_authorized(&alpha));
    }

    #[test]
    fn revoke_while_unmounted_mounts_with_remaining_key_first() {
        let mut h = handler(FakeCryptoManager::new());
        let alpha = Key::from("alpha");
        let beta = Key::from("beta");
        h.handle_key_inserted(&alpha);
        h.authorize_key(&alpha, AuthorizeFlags::default()).unwrap();
        h.handle_key_inserted(&beta);
        h.authorize_key(&beta, AuthorizeFlags::default()).unwrap();
        h.crypto_mut().unmount_file_system().unwrap();

        h.revoke_key_authorization(&beta).unwrap();
        assert!(!h.is_key_authorized(&beta));
        // the remaining key was probed, which mounted the store
        assert!(h.crypto().file_system_is_mounted());
    }

    #[test]
    fn revoke_authenticates_with_retained_uninserted_key() {
        let mut h = handler(FakeCryptoManager::new());
        let alpha = Key::from("alpha");
        let beta = Key::from("beta");
        h.handle_key_inserted(&alpha);
        h.authorize_key(&alpha, AuthorizeFlags::default()).unwrap();
        h.handle_key_inserted(&beta);
        h.authorize_key(&beta, AuthorizeFlags::default()).unwrap();
        // alpha is pulled but stays authorized
        h.handle_key_disabled(&alpha);

        h.revoke_key_authorization(&beta).unwrap();
        assert!(!h.is_key_authorized(&beta));
        assert!(h.is_key_authorized(&alpha));
    }

    #[test]
    fn disabling_last_authorized_key_is_reported() {
        let mut h = handler(FakeCryptoManager::new());
        let alpha = Key::from("alpha");
        let beta = Key::from("beta");
        h.handle_key_inserted(&alpha);
        h.authorize_key(&alpha, AuthorizeFlags::default()).unwrap();
        h.handle_key_inserted(&beta);

        assert_eq!(h.handle_key_disabled(&beta), KeyDisableOutcome::Disabled);
        assert_eq!(
            h.handle_key_disabled(&alpha),
            KeyDisableOutcome::LastAuthorizedGone
        );
        assert_eq!(
            h.handle_key_disabled(&alpha),
            KeyDisableOutcome::NotInserted
        );
        // authorization survives physical removal
        assert!(h.is_key_authorized(&alpha));
    }

    #[test]
    fn key_unlocking_existing_store_skips_the_policy() {
        // daemon restart: store on disk, in-memory authorized set empty
        let fake = FakeCryptoManager::with_existing_store(vec![Key::from("alpha")]);
        let mut h = handler(fake);
        assert_eq!(
            h.handle_key_inserted(&Key::from("alpha")),
            KeyInsertOutcome::AuthorizedKeyAvailable
        );
        assert!(h.is_key_authorized(&Key::from("alpha")));
        // the probe left the store mounted
        assert!(h.crypto().file_system_is_mounted());
    }

    #[test]
    fn mount_with_authorized_key_uses_probe_mount() {
        let fake = FakeCryptoManager::with_existing_store(vec![Key::from("alpha")]);
        let mut h = handler(fake);
        h.authorized.push(Key::from("alpha"));
        h.handle_key_inserted(&Key::from("alpha"));
        h.mount_with_authorized_key().unwrap();
        assert!(h.crypto().file_system_is_mounted());
    }
}
