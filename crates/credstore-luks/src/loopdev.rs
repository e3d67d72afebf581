//! Loop device attachment via `losetup`.

use crate::command::{output_diagnostic, resolve_binary, SystemCommand};
use credstore_core::error::{StoreError, StoreResult};
use std::path::Path;
use std::time::Duration;

const DEFAULT_LOSETUP_PATHS: &[&str] = &[
    "/usr/sbin/losetup",
    "/usr/bin/losetup",
    "/sbin/losetup",
    "/bin/losetup",
];

#[derive(Debug, Clone)]
pub(crate) struct Losetup {
    cmd: SystemCommand,
}

impl Losetup {
    pub(crate) fn resolve(timeout: Duration) -> StoreResult<Self> {
        let binary = resolve_binary("losetup", DEFAULT_LOSETUP_PATHS)?;
        Ok(Self {
            cmd: SystemCommand::new(binary, timeout),
        })
    }

    /// Attach `file` to the first free loop device and return its path.
    pub(crate) fn attach(&self, file: &Path) -> StoreResult<String> {
        let file_arg = file.to_string_lossy().into_owned();
        let out = self.cmd.run(&["--find", "--show", &file_arg], None)?;
        if out.status != 0 {
            let diagnostic = output_diagnostic(&out);
            let lower = diagnostic.to_ascii_lowercase();
            if lower.contains("could not find any free loop device")
                || lower.contains("no such device")
            {
                return Err(StoreError::NoLoopDevice);
            }
            return Err(StoreError::Crypto(format!(
                "losetup failed to attach {}: {diagnostic} (exit code {})",
                file.display(),
                out.status
            )));
        }

        let device = out.stdout.trim().to_string();
        if device.is_empty() {
            return Err(StoreError::NoLoopDevice);
        }
        Ok(device)
    }

    pub(crate) fn detach(&self, device: &str) -> StoreResult<()> {
        let out = self.cmd.run(&["-d", device], None)?;
        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("no such device") || lower.contains("no such file") {
            return Ok(());
        }
        Err(StoreError::Crypto(format!(
            "losetup failed to detach {device}: {diagnostic} (exit code {})",
            out.status
        )))
    }
}
