//! `cryptsetup` invocations for format, open, close, and key-slot changes.

use crate::command::{output_diagnostic, resolve_binary, Output, SystemCommand};
use credstore_core::error::{StoreError, StoreResult};
use credstore_provider::Key;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];

#[derive(Debug, Clone)]
pub(crate) struct Cryptsetup {
    cmd: SystemCommand,
}

impl Cryptsetup {
    pub(crate) fn resolve(timeout: Duration) -> StoreResult<Self> {
        let binary = resolve_binary("cryptsetup", DEFAULT_CRYPTSETUP_PATHS)?;
        Ok(Self {
            cmd: SystemCommand::new(binary, timeout),
        })
    }

    /// Format `device` as a LUKS container keyed by `key`. Destroys any
    /// previous contents.
    pub(crate) fn luks_format(&self, device: &str, key: &Key) -> StoreResult<()> {
        let out = self.cmd.run(
            &["luksFormat", "--batch-mode", "--key-file", "-", device],
            Some(key.as_bytes()),
        )?;
        if out.status == 0 {
            return Ok(());
        }
        Err(failure("format", device, &out))
    }

    /// Open the LUKS container on `device` under `/dev/mapper/<name>`.
    pub(crate) fn open(&self, device: &str, name: &str, key: &Key) -> StoreResult<()> {
        let primary_args = [
            "open",
            "--type",
            "luks",
            "--batch-mode",
            "--key-file",
            "-",
            device,
            name,
        ];
        let mut out = self.cmd.run(&primary_args, Some(key.as_bytes()))?;

        if out.status != 0 && action_unsupported(&out) {
            let fallback_args = ["luksOpen", "--batch-mode", "--key-file", "-", device, name];
            out = self.cmd.run(&fallback_args, Some(key.as_bytes()))?;
        }

        if out.status == 0 {
            return Ok(());
        }
        Err(failure("open", device, &out))
    }

    /// Close the mapping. A mapping that is already gone is not an error.
    pub(crate) fn close(&self, name: &str) -> StoreResult<()> {
        let mut out = self.cmd.run(&["close", name], None)?;
        if out.status != 0 && action_unsupported(&out) {
            out = self.cmd.run(&["luksClose", name], None)?;
        }

        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out).to_ascii_lowercase();
        if diagnostic.contains("does not exist")
            || diagnostic.contains("doesn't exist")
            || diagnostic.contains("not active")
        {
            return Ok(());
        }

        Err(failure("close", name, &out))
    }

    /// Enroll `new_key` into a free key slot, authenticated by `existing`.
    pub(crate) fn add_key(&self, device: &str, new_key: &Key, existing: &Key) -> StoreResult<()> {
        let keyfile = write_key_tempfile(new_key)?;
        let key_arg = keyfile.path().to_string_lossy().into_owned();
        let out = self.cmd.run(
            &[
                "luksAddKey",
                "--batch-mode",
                "--key-file",
                "-",
                device,
                &key_arg,
            ],
            Some(existing.as_bytes()),
        )?;
        if out.status == 0 {
            return Ok(());
        }
        Err(failure("add key", device, &out))
    }

    /// Remove the key slot matching `key`.
    pub(crate) fn remove_key(&self, device: &str, key: &Key) -> StoreResult<()> {
        let out = self.cmd.run(
            &["luksRemoveKey", "--batch-mode", "--key-file", "-", device],
            Some(key.as_bytes()),
        )?;
        if out.status == 0 {
            return Ok(());
        }
        Err(failure("remove key", device, &out))
    }

    /// Check whether `key` opens `device` without activating a mapping.
    pub(crate) fn test_passphrase(&self, device: &str, key: &Key) -> StoreResult<bool> {
        let out = self.cmd.run(
            &[
                "open",
                "--test-passphrase",
                "--batch-mode",
                "--key-file",
                "-",
                device,
            ],
            Some(key.as_bytes()),
        )?;
        Ok(out.status == 0)
    }
}

/// Stage key material in a private temp file. Only `luksAddKey` needs this:
/// its new key is a positional file argument, while every other action takes
/// the key on stdin via `--key-file -`.
fn write_key_tempfile(key: &Key) -> StoreResult<NamedTempFile> {
    let mut temp = NamedTempFile::new()?;
    temp.as_file_mut().write_all(key.as_bytes())?;
    temp.as_file_mut().flush()?;
    std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o400))?;
    Ok(temp)
}

fn action_unsupported(output: &Output) -> bool {
    let diagnostic = output_diagnostic(output).to_ascii_lowercase();
    diagnostic.contains("unknown action")
        || diagnostic.contains("unknown command")
        || diagnostic.contains("invalid action")
        || diagnostic.contains("invalid command")
        || diagnostic.contains("unknown option")
}

fn failure(action: &str, target: &str, out: &Output) -> StoreError {
    let diagnostic = {
        let trimmed = output_diagnostic(out);
        if trimmed.is_empty() {
            "no additional output".to_string()
        } else {
            trimmed
        }
    };
    let lower = diagnostic.to_ascii_lowercase();

    let message = if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("keyslot")
        || lower.contains("key slot")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
    {
        format!(
            "cryptsetup rejected the provided key material during {action} on `{target}`: {diagnostic}"
        )
    } else if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        format!(
            "cryptsetup {action} on `{target}` needs elevated privileges: {diagnostic}"
        )
    } else if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("cannot open device")
    {
        format!("cryptsetup could not access `{target}` during {action}: {diagnostic}")
    } else {
        format!("cryptsetup {action} on `{target}` failed: {diagnostic}")
    };

    StoreError::Crypto(format!("{message} (exit code {})", out.status))
}

/// `PathBuf` of the mapper node for `name`.
pub(crate) fn mapper_device(name: &str) -> PathBuf {
    PathBuf::from("/dev/mapper").join(name)
}
