use std::sync::Arc;

use img_shared::ImgResult;

use super::Snapshotter;
use crate::executor::Mountable;
use crate::mount::Mount;

/// A snapshot handed to the executor as a rootfs or extra mount.
#[derive(Debug, Clone)]
pub enum SnapshotRef {
    /// Active snapshot, mounted read-write.
    Mutable {
        snapshotter: Arc<Snapshotter>,
        key: String,
    },
    /// Committed snapshot, bound read-only in place.
    Immutable {
        snapshotter: Arc<Snapshotter>,
        name: String,
    },
}

impl SnapshotRef {
    pub fn mutable(snapshotter: Arc<Snapshotter>, key: impl Into<String>) -> Self {
        Self::Mutable {
            snapshotter,
            key: key.into(),
        }
    }

    pub fn immutable(snapshotter: Arc<Snapshotter>, name: impl Into<String>) -> Self {
        Self::Immutable {
            snapshotter,
            name: name.into(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Mutable { key, .. } => key,
            Self::Immutable { name, .. } => name,
        }
    }
}

impl Mountable for SnapshotRef {
    fn mount(&self) -> ImgResult<Vec<Mount>> {
        match self {
            Self::Mutable { snapshotter, key } => snapshotter.mounts(key),
            Self::Immutable { snapshotter, name } => {
                Ok(vec![Mount::bind(snapshotter.committed_dir(name)?, true)])
            }
        }
    }

    fn is_readonly(&self) -> bool {
        matches!(self, Self::Immutable { .. })
    }
}
