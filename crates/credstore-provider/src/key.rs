//! Opaque key material shared across key managers, the key handler, and the
//! crypto manager.
//!
//! Keys are compared byte-for-byte and carry no other semantics. Raw key
//! bytes are wiped on drop and never appear in log output; logging surfaces
//! only a truncated SHA-256 fingerprint.

use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use zeroize::Zeroizing;

/// An encryption secret observed from a key manager.
///
/// The empty key is reserved for the "nothing to offer" readiness report and
/// never participates in authorization.
#[derive(Clone, Default)]
pub struct Key(Zeroizing<Vec<u8>>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    /// The "no key" report used for readiness bookkeeping.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short hex fingerprint safe to include in diagnostics.
    pub fn fingerprint(&self) -> String {
        if self.is_empty() {
            return "empty".to_string();
        }
        hex::encode(&Sha256::digest(&self.0[..])[..4])
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0[..].hash(state);
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(len={}, fp={})", self.len(), self.fingerprint())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{}", self.fingerprint())
    }
}
