//! Mount descriptors and scoped bind mounts.
//!
//! Snapshots are exposed as [`Mount`] descriptors. [`mount_all`] turns them
//! into real bind mounts and hands back a [`MountGuard`] that unmounts when
//! dropped. Every live guard is also tracked by the process-wide shutdown
//! registry so a terminating signal still releases it (see [`shutdown`]).

pub mod shutdown;

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use serde::{Deserialize, Serialize};

use img_shared::{ImgError, ImgResult};

pub use shutdown::install_shutdown_hook;

/// Mount option marking a read-only mount.
pub const OPT_RO: &str = "ro";
/// Mount option marking a read-write mount.
pub const OPT_RW: &str = "rw";
/// Mount option requesting a recursive bind.
pub const OPT_RBIND: &str = "rbind";

/// One OS mount to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub typ: String,
    pub source: PathBuf,
    pub options: Vec<String>,
}

impl Mount {
    /// Recursive bind mount of `source`.
    pub fn bind(source: impl Into<PathBuf>, readonly: bool) -> Self {
        let flag = if readonly { OPT_RO } else { OPT_RW };
        Self {
            typ: "bind".to_string(),
            source: source.into(),
            options: vec![flag.to_string(), OPT_RBIND.to_string()],
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == OPT_RO)
    }

    fn ms_flags(&self) -> ImgResult<MsFlags> {
        let mut flags = MsFlags::empty();
        for option in &self.options {
            match option.as_str() {
                "bind" => flags |= MsFlags::MS_BIND,
                OPT_RBIND => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
                OPT_RO => flags |= MsFlags::MS_RDONLY,
                OPT_RW => {}
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                other => {
                    return Err(ImgError::Unsupported(format!(
                        "mount option {} on {}",
                        other,
                        self.source.display()
                    )));
                }
            }
        }
        if self.typ == "bind" {
            flags |= MsFlags::MS_BIND;
        }
        Ok(flags)
    }
}

/// How a snapshot's changes are computed against its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffStrategy {
    /// Read both snapshot directories in place.
    #[default]
    DirectCompare,
    /// Bind both sides onto temporary mountpoints first. Needs a mount
    /// namespace.
    MountAndDiff,
}

/// Bind-mount every descriptor in `mounts` onto `target`, in order.
///
/// Read-only bind mounts need a second `MS_REMOUNT` pass; the kernel ignores
/// `MS_RDONLY` on the initial bind. On failure everything mounted so far is
/// released before the error is returned.
pub fn mount_all(mounts: &[Mount], target: &Path) -> ImgResult<MountGuard> {
    if mounts.is_empty() {
        return Err(ImgError::MountFailed(format!(
            "no mounts to apply on {}",
            target.display()
        )));
    }

    let mut guard = MountGuard::new(target);
    for m in mounts {
        let flags = m.ms_flags()?;
        nix::mount::mount(
            Some(m.source.as_path()),
            target,
            None::<&str>,
            flags & !MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| {
            ImgError::MountFailed(format!(
                "bind {} on {}: {}",
                m.source.display(),
                target.display(),
                e
            ))
        })?;
        guard.depth += 1;
        shutdown::record_mount(target);

        if flags.contains(MsFlags::MS_RDONLY) {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| {
                ImgError::MountFailed(format!(
                    "remount {} read-only: {}",
                    target.display(),
                    e
                ))
            })?;
        }

        tracing::debug!(
            source = %m.source.display(),
            target = %target.display(),
            readonly = m.is_readonly(),
            "Mounted"
        );
    }

    Ok(guard)
}

/// Unmount `target`, falling back to a lazy detach when it is busy.
pub fn unmount(target: &Path) -> ImgResult<()> {
    match nix::mount::umount2(target, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EBUSY) => {
            tracing::warn!(target = %target.display(), "Mount busy, detaching lazily");
            nix::mount::umount2(target, MntFlags::MNT_DETACH).map_err(|e| {
                ImgError::MountFailed(format!("detach {}: {}", target.display(), e))
            })
        }
        Err(e) => Err(ImgError::MountFailed(format!(
            "unmount {}: {}",
            target.display(),
            e
        ))),
    }
}

/// Scoped set of mounts stacked on one target.
///
/// Unmounts on drop. Use [`MountGuard::unmount`] to observe the error
/// instead of having it logged.
#[derive(Debug)]
pub struct MountGuard {
    target: PathBuf,
    depth: usize,
}

impl MountGuard {
    fn new(target: &Path) -> Self {
        shutdown::register(target);
        Self {
            target: target.to_path_buf(),
            depth: 0,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn unmount(mut self) -> ImgResult<()> {
        self.release()
    }

    fn release(&mut self) -> ImgResult<()> {
        let mut result = Ok(());
        while self.depth > 0 {
            if let Err(e) = unmount(&self.target) {
                result = Err(e);
                break;
            }
            self.depth -= 1;
            shutdown::record_unmount(&self.target);
        }
        if result.is_ok() {
            shutdown::unregister(&self.target);
        }
        result
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.depth == 0 {
            shutdown::unregister(&self.target);
            return;
        }
        if let Err(e) = self.release() {
            tracing::error!(target = %self.target.display(), error = %e, "Failed to unmount");
        }
    }
}

/// Run `f` with `mounts` bound on a fresh temporary directory.
pub fn with_temp_mount<T>(
    mounts: &[Mount],
    f: impl FnOnce(&Path) -> ImgResult<T>,
) -> ImgResult<T> {
    let dir = tempfile::Builder::new()
        .prefix("img-mount-")
        .tempdir()
        .map_err(|e| ImgError::Storage(format!("failed to create temp mountpoint: {}", e)))?;
    let guard = mount_all(mounts, dir.path())?;
    let result = f(dir.path());
    guard.unmount()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_options() {
        let rw = Mount::bind("/snapshots/1", false);
        assert_eq!(rw.typ, "bind");
        assert_eq!(rw.options, vec!["rw", "rbind"]);
        assert!(!rw.is_readonly());

        let ro = Mount::bind("/snapshots/1", true);
        assert_eq!(ro.options, vec!["ro", "rbind"]);
        assert!(ro.is_readonly());
    }

    #[test]
    fn test_ms_flags() {
        let flags = Mount::bind("/x", true).ms_flags().unwrap();
        assert!(flags.contains(MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_RDONLY));

        let flags = Mount::bind("/x", false).ms_flags().unwrap();
        assert!(!flags.contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let m = Mount {
            typ: "bind".into(),
            source: "/x".into(),
            options: vec!["uid=0".into()],
        };
        assert!(matches!(m.ms_flags(), Err(ImgError::Unsupported(_))));
    }

    #[test]
    fn test_mount_all_requires_mounts() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            mount_all(&[], dir.path()),
            Err(ImgError::MountFailed(_))
        ));
    }

    #[test]
    fn test_diff_strategy_serde() {
        let json = serde_json::to_string(&DiffStrategy::MountAndDiff).unwrap();
        assert_eq!(json, "\"mount-and-diff\"");
        assert_eq!(DiffStrategy::default(), DiffStrategy::DirectCompare);
    }
}
