#![forbid(unsafe_code)]

//! Pluggable contracts for the credstore daemon.
//!
//! The core crate defines workflows and orchestration against these traits
//! so concrete integrations (LUKS-backed storage, hardware key sources,
//! site-specific authorization policy) can be swapped by configuration name
//! without touching the orchestrator.

mod key;

pub use key::Key;

use std::error::Error;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

/// Key lifecycle events emitted by a key manager.
#[derive(Debug, Clone)]
pub enum KeyEvent {
    /// A key became available. An `Inserted` event carrying an empty key is
    /// the "nothing to offer" report that still counts toward readiness.
    Inserted(Key),
    /// The key is no longer available from its manager.
    Disabled(Key),
    /// The key is gone permanently and will never be offered again. Managers
    /// should disable before removing; the key handler enforces that
    /// ordering regardless.
    Removed(Key),
}

/// A key event tagged with the reporting manager's name.
#[derive(Debug, Clone)]
pub struct KeyManagerEvent {
    pub manager: String,
    pub event: KeyEvent,
}

/// Sending half handed to a key manager during `setup`.
#[derive(Debug, Clone)]
pub struct KeyEventReporter {
    manager: String,
    tx: mpsc::UnboundedSender<KeyManagerEvent>,
}

impl KeyEventReporter {
    pub fn new(manager: impl Into<String>, tx: mpsc::UnboundedSender<KeyManagerEvent>) -> Self {
        Self {
            manager: manager.into(),
            tx,
        }
    }

    pub fn key_inserted(&self, key: Key) {
        self.send(KeyEvent::Inserted(key));
    }

    pub fn key_disabled(&self, key: Key) {
        self.send(KeyEvent::Disabled(key));
    }

    pub fn key_removed(&self, key: Key) {
        self.send(KeyEvent::Removed(key));
    }

    /// Report that this manager has nothing to offer right now.
    pub fn no_keys(&self) {
        self.send(KeyEvent::Inserted(Key::empty()));
    }

    fn send(&self, event: KeyEvent) {
        // The receiving loop outlives every manager; a closed channel only
        // happens during shutdown and the event is moot then.
        let _ = self.tx.send(KeyManagerEvent {
            manager: self.manager.clone(),
            event,
        });
    }
}

/// A source of keys (password prompt, hardware token, key file directory).
///
/// Managers report key availability; they never decide authorization.
pub trait KeyManager {
    type Error: Error + Send + Sync + 'static;

    /// Stable name used for readiness bookkeeping and logging.
    fn name(&self) -> &str;

    /// Begin reporting key events through `reporter`. Called exactly once.
    fn setup(&mut self, reporter: KeyEventReporter) -> Result<(), Self::Error>;
}

/// Why the orchestrator is asking for an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationReason {
    SystemStarted,
    KeyInserted,
    StorageNeeded,
}

/// Outcome of an authorization query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDecision {
    /// No action; the key stays unauthorized.
    Denied,
    /// Add the key non-destructively alongside the existing authorized keys.
    Approved,
    /// Reformat the store so this key becomes its only key. Destroys any
    /// previously stored secrets.
    Exclusive,
}

/// Read-only snapshot supplied alongside an authorization query so policies
/// can decide without a back-reference into the key handler.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationContext {
    pub store_is_setup: bool,
    pub has_authorized_keys: bool,
}

/// Sending half of a pending authorization decision. Consumed on send so a
/// policy can reply at most once.
pub struct DecisionSender(oneshot::Sender<KeyDecision>);

impl DecisionSender {
    pub fn send(self, decision: KeyDecision) {
        let _ = self.0.send(decision);
    }
}

/// Pending asynchronous authorization decision.
///
/// Dropping the sender without replying resolves to `Denied` (fail safe).
pub struct DecisionTicket(oneshot::Receiver<KeyDecision>);

impl DecisionTicket {
    pub fn channel() -> (DecisionSender, DecisionTicket) {
        let (tx, rx) = oneshot::channel();
        (DecisionSender(tx), DecisionTicket(rx))
    }

    /// Wait for the decision.
    pub async fn decision(self) -> KeyDecision {
        self.0.await.unwrap_or(KeyDecision::Denied)
    }

    /// Non-blocking poll, for callers without an event loop.
    pub fn try_decision(&mut self) -> Option<KeyDecision> {
        match self.0.try_recv() {
            Ok(decision) => Some(decision),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(KeyDecision::Denied),
        }
    }
}

/// Policy decision point: may a newly observed key unlock (or reformat) the
/// encrypted store?
///
/// The query mutates nothing; the decision arrives through the returned
/// ticket, possibly much later (interactive confirmation, remote policy).
pub trait KeyAuthorizer {
    fn query_key_authorization(
        &self,
        key: &Key,
        reason: AuthorizationReason,
        ctx: AuthorizationContext,
    ) -> DecisionTicket;
}

/// Mount progression for the encrypted store.
///
/// Strictly forward on success; any failure at any step unwinds all the way
/// back to `Unmounted`, releasing intermediate resources in reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MountState {
    Unmounted,
    LoopAttached,
    BlockEncryptionFormatted,
    BlockEncryptionOpened,
    Mounted,
}

/// Owner of the encrypted-filesystem lifecycle.
///
/// Implementations validate their configuration at construction time and
/// must never leave partially acquired OS resources behind on failure. The
/// caller (the key handler) is responsible for key-ring invariants such as
/// never removing the last key slot.
pub trait CryptoManager {
    type Error: Error + Send + Sync + 'static;

    /// Stage the key used by the next `setup_file_system`/`mount_file_system`.
    fn set_encryption_key(&mut self, key: Key);

    /// Destructive initialize-and-mount: (re)creates the backing store,
    /// formats block-level encryption with the staged key, creates a fresh
    /// filesystem inside it, and mounts it. Overwrites any prior store.
    fn setup_file_system(&mut self) -> Result<(), Self::Error>;

    /// Non-destructive mount of an already-existing store using the staged
    /// key.
    fn mount_file_system(&mut self) -> Result<(), Self::Error>;

    /// Unwind the current mount state one step at a time down to
    /// `Unmounted`. Already-unmounted races on the unmount step are logged
    /// and tolerated; every remaining step is still attempted and the call
    /// succeeds only if every reachable step succeeded.
    fn unmount_file_system(&mut self) -> Result<(), Self::Error>;

    /// Add `key` as an additional key slot, authenticating with `existing`.
    /// Valid only while the encrypted mapping is open.
    fn add_encryption_key(&mut self, key: &Key, existing: &Key) -> Result<(), Self::Error>;

    /// Remove `key`'s slot, authenticating with `remaining`. Valid only
    /// while the encrypted mapping is open. This layer trusts its caller to
    /// never remove the last slot.
    fn remove_encryption_key(&mut self, key: &Key, remaining: &Key) -> Result<(), Self::Error>;

    /// Whether `key` currently unlocks the store.
    ///
    /// Side effect: when the store is not mounted this probes by attempting
    /// a full mount with `key`, and leaves the store mounted on success.
    /// Surprising but deliberate; callers that only want a pure query must
    /// check `file_system_is_mounted` first.
    fn encryption_key_in_use(&mut self, key: &Key) -> bool;

    fn file_system_is_setup(&self) -> bool;

    fn file_system_is_mounted(&self) -> bool;

    fn file_system_mount_path(&self) -> PathBuf;

    /// On-disk paths an external backup facility must copy verbatim while
    /// the store is unmounted.
    fn backup_files(&self) -> Vec<PathBuf>;
}

/// Peer authorization for daemon method calls. Loaded by configuration name
/// alongside the other plugins; the decision model itself lives outside this
/// core.
pub trait AccessControlManager {
    fn is_peer_allowed(&self, peer: &str, method: &str) -> bool;
}

/// Handle on a credentials database (metadata or secrets).
///
/// The orchestrator opens and closes these in lockstep with the encrypted
/// filesystem; the schema is owned by the storage implementation.
pub trait SecretsStorage {
    type Error: Error + Send + Sync + 'static;

    fn open(&mut self, path: &std::path::Path) -> Result<(), Self::Error>;

    fn close(&mut self) -> Result<(), Self::Error>;

    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_decision_sender_resolves_denied() {
        let (tx, mut ticket) = DecisionTicket::channel();
        drop(tx);
        assert_eq!(ticket.try_decision(), Some(KeyDecision::Denied));
    }

    #[test]
    fn decision_ticket_delivers_once() {
        let (tx, mut ticket) = DecisionTicket::channel();
        assert_eq!(ticket.try_decision(), None);
        tx.send(KeyDecision::Approved);
        assert_eq!(ticket.try_decision(), Some(KeyDecision::Approved));
    }

    #[test]
    fn reporter_tags_events_with_manager_name() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = KeyEventReporter::new("password", tx);
        reporter.key_inserted(Key::from("pw1"));
        reporter.no_keys();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.manager, "password");
        assert!(matches!(first.event, KeyEvent::Inserted(ref k) if !k.is_empty()));

        let second = rx.try_recv().unwrap();
        assert!(matches!(second.event, KeyEvent::Inserted(ref k) if k.is_empty()));
    }
}
