//! Filesystem creation and (un)mounting of the opened mapping.

use crate::command::{output_diagnostic, resolve_binary, SystemCommand};
use credstore_core::config::FileSystemType;
use credstore_core::error::{StoreError, StoreResult};
use std::path::Path;
use std::time::Duration;

const DEFAULT_MOUNT_PATHS: &[&str] = &["/usr/bin/mount", "/bin/mount", "/usr/sbin/mount"];
const DEFAULT_UMOUNT_PATHS: &[&str] = &["/usr/bin/umount", "/bin/umount", "/usr/sbin/umount"];
const DEFAULT_MKFS_DIRS: &[&str] = &["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

#[derive(Debug, Clone)]
pub(crate) struct FilesystemTools {
    mkfs: SystemCommand,
    mount: SystemCommand,
    umount: SystemCommand,
}

impl FilesystemTools {
    pub(crate) fn resolve(fs_type: FileSystemType, timeout: Duration) -> StoreResult<Self> {
        let mkfs_name = fs_type.mkfs_binary();
        let mkfs_defaults: Vec<String> = DEFAULT_MKFS_DIRS
            .iter()
            .map(|dir| format!("{dir}/{mkfs_name}"))
            .collect();
        let mkfs_refs: Vec<&str> = mkfs_defaults.iter().map(String::as_str).collect();

        Ok(Self {
            mkfs: SystemCommand::new(resolve_binary(mkfs_name, &mkfs_refs)?, timeout),
            mount: SystemCommand::new(resolve_binary("mount", DEFAULT_MOUNT_PATHS)?, timeout),
            umount: SystemCommand::new(resolve_binary("umount", DEFAULT_UMOUNT_PATHS)?, timeout),
        })
    }

    pub(crate) fn make_file_system(&self, device: &str) -> StoreResult<()> {
        let out = self.mkfs.run(&["-q", device], None)?;
        if out.status == 0 {
            return Ok(());
        }
        Err(StoreError::Crypto(format!(
            "{} failed on {device}: {} (exit code {})",
            self.mkfs.binary().display(),
            output_diagnostic(&out),
            out.status
        )))
    }

    pub(crate) fn mount(&self, device: &str, dir: &Path) -> StoreResult<()> {
        std::fs::create_dir_all(dir)?;
        let dir_arg = dir.to_string_lossy().into_owned();
        let out = self
            .mount
            .run(&["-o", "nosuid,nodev", device, &dir_arg], None)?;
        if out.status == 0 {
            return Ok(());
        }
        Err(StoreError::Crypto(format!(
            "mount of {device} at {} failed: {} (exit code {})",
            dir.display(),
            output_diagnostic(&out),
            out.status
        )))
    }

    /// Unmount `dir`. A target that is already unmounted is not an error.
    pub(crate) fn unmount(&self, dir: &Path) -> StoreResult<()> {
        let dir_arg = dir.to_string_lossy().into_owned();
        let out = self.umount.run(&[&dir_arg], None)?;
        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("not mounted")
            || lower.contains("no such file")
            || lower.contains("not found")
        {
            return Ok(());
        }
        Err(StoreError::Crypto(format!(
            "umount of {} failed: {diagnostic} (exit code {})",
            dir.display(),
            out.status
        )))
    }
}
