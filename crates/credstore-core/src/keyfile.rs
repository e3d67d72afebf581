//! Key file parsing helpers shared by the daemon and tests.

use crate::error::{StoreError, StoreResult};
use credstore_provider::Key;
use hex::FromHex;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Read bytes from `path` and decode them into key material.
pub fn read_key_file(path: &Path) -> StoreResult<Key> {
    let contents = Zeroizing::new(fs::read(path)?);
    decode_key_bytes(path, &contents)
}

/// Decode bytes into key material.
///
/// Surrounding ASCII whitespace is ignored. If the remaining bytes form an
/// even-length hex string they are decoded to raw bytes; anything else is
/// taken verbatim. Empty material is rejected, so a key decoded here never
/// collides with the empty "no keys" readiness report.
pub fn decode_key_bytes(origin: &Path, bytes: &[u8]) -> StoreResult<Key> {
    let trimmed = trim_ascii_whitespace(bytes);
    if trimmed.is_empty() {
        return Err(invalid_key(origin, "file is empty"));
    }

    if trimmed.len() >= 2
        && trimmed.len() % 2 == 0
        && trimmed.iter().all(u8::is_ascii_hexdigit)
    {
        let text = std::str::from_utf8(trimmed)
            .map_err(|_| invalid_key(origin, "hex key contains non-UTF-8 characters"))?;
        let decoded = Vec::from_hex(text)
            .map_err(|err| invalid_key(origin, format!("hex decode failed: {err}")))?;
        return Ok(Key::new(decoded));
    }

    Ok(Key::new(trimmed.to_vec()))
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn invalid_key(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidKey {
        path: PathBuf::from(path),
        reason: reason.into(),
    }
}
