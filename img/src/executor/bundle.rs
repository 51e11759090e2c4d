use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use img_shared::layout::BundleLayout;
use img_shared::{ImgError, ImgResult};

use crate::mount::{Mount, MountGuard, mount_all};

/// A bundle directory that exists for the duration of one step.
///
/// Dropping it unmounts `rootfs/` (when it was mounted) and then removes the
/// whole directory. If the unmount fails the directory is left in place, so
/// that the removal can never descend into a live snapshot.
#[derive(Debug)]
pub(super) struct Bundle {
    layout: BundleLayout,
    rootfs_mount: Option<MountGuard>,
}

impl Bundle {
    pub(super) fn create(layout: BundleLayout) -> ImgResult<Self> {
        fs::DirBuilder::new()
            .mode(0o711)
            .create(layout.dir())
            .map_err(|e| {
                ImgError::Storage(format!(
                    "failed to create bundle {}: {}",
                    layout.dir().display(),
                    e
                ))
            })?;
        tracing::debug!(bundle = %layout.dir().display(), "Created bundle");
        Ok(Self {
            layout,
            rootfs_mount: None,
        })
    }

    pub(super) fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// Bind `mounts` onto `rootfs/` and return its path.
    pub(super) fn mount_rootfs(&mut self, mounts: &[Mount]) -> ImgResult<PathBuf> {
        let rootfs = self.layout.rootfs_dir();
        fs::DirBuilder::new()
            .mode(0o755)
            .create(&rootfs)
            .map_err(|e| {
                ImgError::Storage(format!("failed to create {}: {}", rootfs.display(), e))
            })?;
        self.rootfs_mount = Some(mount_all(mounts, &rootfs)?);
        Ok(rootfs)
    }

    fn remove(&mut self) {
        if let Some(guard) = self.rootfs_mount.take()
            && let Err(e) = guard.unmount()
        {
            tracing::error!(
                bundle = %self.layout.dir().display(),
                error = %e,
                "Failed to unmount rootfs, leaving bundle in place"
            );
            return;
        }
        remove_dir(self.layout.dir());
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        self.remove();
    }
}

fn remove_dir(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => tracing::debug!(bundle = %dir.display(), "Removed bundle"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(bundle = %dir.display(), error = %e, "Failed to remove bundle"),
    }
}
