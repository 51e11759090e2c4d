//! Persisted state layout.
//!
//! ```text
//! {state}/
//! ├── .lock
//! └── {executor}/
//!     └── {backend}/
//!         ├── metadata.db
//!         ├── snapshots/
//!         │   ├── {id}/             # committed
//!         │   ├── active-{id}/      # active (writable)
//!         │   ├── view-{id}/        # parentless view
//!         │   ├── new-*/            # materialization temp
//!         │   └── removed-{id}/     # removal marker
//!         └── executor/
//!             ├── resolv.conf
//!             ├── hosts
//!             └── {bundle-id}/
//!                 ├── config.json
//!                 └── rootfs/
//! ```

use std::path::{Path, PathBuf};

/// Directory and file names.
pub mod dirs {
    pub const SNAPSHOTS: &str = "snapshots";
    pub const EXECUTOR: &str = "executor";
    pub const ROOTFS: &str = "rootfs";

    pub const METADATA_DB: &str = "metadata.db";
    pub const CONFIG_JSON: &str = "config.json";
    pub const LOCK_FILE: &str = ".lock";

    pub const NEW_PREFIX: &str = "new-";
    pub const ACTIVE_PREFIX: &str = "active-";
    pub const VIEW_PREFIX: &str = "view-";
    pub const REMOVED_PREFIX: &str = "removed-";
}

/// Top-level state directory: `{state}/{executor}/{backend}/`.
#[derive(Clone, Debug)]
pub struct StateLayout {
    state_dir: PathBuf,
    root: PathBuf,
}

impl StateLayout {
    pub fn new(state_dir: impl Into<PathBuf>, executor: &str, backend: &str) -> Self {
        let state_dir = state_dir.into();
        let root = state_dir.join(executor).join(backend);
        Self { state_dir, root }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Backend root: {state}/{executor}/{backend}
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join(dirs::LOCK_FILE)
    }

    pub fn metadata_db(&self) -> PathBuf {
        self.root.join(dirs::METADATA_DB)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join(dirs::SNAPSHOTS)
    }

    /// Bundle scratch space, emptied per step.
    pub fn executor_dir(&self) -> PathBuf {
        self.root.join(dirs::EXECUTOR)
    }

    pub fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.snapshots_dir())?;
        std::fs::create_dir_all(self.executor_dir())?;
        Ok(())
    }
}

/// Layout of one execution bundle: `{executor}/{bundle-id}`.
#[derive(Clone, Debug)]
pub struct BundleLayout {
    dir: PathBuf,
}

impl BundleLayout {
    pub fn new(executor_dir: &Path, bundle_id: &str) -> Self {
        Self {
            dir: executor_dir.join(bundle_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.dir.join(dirs::ROOTFS)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(dirs::CONFIG_JSON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_layout_paths() {
        let layout = StateLayout::new("/tmp/img", "runc", "native");

        assert_eq!(layout.root(), Path::new("/tmp/img/runc/native"));
        assert_eq!(
            layout.metadata_db(),
            PathBuf::from("/tmp/img/runc/native/metadata.db")
        );
        assert_eq!(
            layout.snapshots_dir(),
            PathBuf::from("/tmp/img/runc/native/snapshots")
        );
        assert_eq!(
            layout.executor_dir(),
            PathBuf::from("/tmp/img/runc/native/executor")
        );
        assert_eq!(layout.lock_file(), PathBuf::from("/tmp/img/.lock"));
    }

    #[test]
    fn test_bundle_layout_paths() {
        let bundle = BundleLayout::new(Path::new("/tmp/img/runc/native/executor"), "abc");

        assert_eq!(
            bundle.rootfs_dir(),
            PathBuf::from("/tmp/img/runc/native/executor/abc/rootfs")
        );
        assert_eq!(
            bundle.config_path(),
            PathBuf::from("/tmp/img/runc/native/executor/abc/config.json")
        );
    }
}
