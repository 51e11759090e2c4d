//! Snapshot driver.
//!
//! Owns the on-disk layout under `{root}/snapshots/` and keeps it consistent
//! with the metadata store:
//!
//! ```text
//! snapshots/
//! ├── new-XXXXXX/     materialization temp, safe to delete
//! ├── active-{id}/    writable directory of an active snapshot
//! ├── view-{id}/      own directory of a parentless view
//! ├── {id}/           committed, immutable
//! └── removed-{id}/   removal marker, safe to delete
//! ```
//!
//! Each snapshot directory holds the fully materialized content of its
//! parent chain: `prepare` copies the parent eagerly, so a mount only ever
//! needs the top-most directory.
//!
//! Every structural change follows the same shape: open a write transaction,
//! update the record, rename the directory, commit. If the commit fails the
//! rename is undone before the error is returned.

pub mod copy;
mod reference;
pub mod usage;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use img_shared::layout::dirs;
use img_shared::{ImgError, ImgResult};

use crate::metadata::{Kind, MetaStore, Record, Snapshot, SnapshotInfo, Usage};
use crate::mount::{DiffStrategy, Mount};

pub use copy::CopyOptions;
pub use reference::SnapshotRef;

/// What [`Snapshotter::reconcile`] changed on disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Leftover or orphaned directories that were deleted.
    pub removed: Vec<PathBuf>,
    /// Directories renamed back to match their record.
    pub restored: Vec<PathBuf>,
}

/// Copy-on-prepare snapshot driver.
#[derive(Debug)]
pub struct Snapshotter {
    root: PathBuf,
    store: MetaStore,
    strategy: DiffStrategy,
    copy_options: CopyOptions,
}

impl Snapshotter {
    /// Open the snapshotter rooted at `root`, creating the layout on first use.
    pub fn new(root: &Path, strategy: DiffStrategy) -> ImgResult<Self> {
        let snapshots = root.join(dirs::SNAPSHOTS);
        fs::create_dir_all(&snapshots).map_err(|e| {
            ImgError::Storage(format!(
                "failed to create snapshot root {}: {}",
                snapshots.display(),
                e
            ))
        })?;
        let store = MetaStore::open(&root.join(dirs::METADATA_DB))?;

        tracing::info!(root = %root.display(), ?strategy, "Opened snapshotter");

        Ok(Self {
            root: root.to_path_buf(),
            store,
            strategy,
            copy_options: CopyOptions::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn diff_strategy(&self) -> DiffStrategy {
        self.strategy
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &MetaStore {
        &self.store
    }

    /// Info for an active, view or committed snapshot.
    pub fn stat(&self, key: &str) -> ImgResult<SnapshotInfo> {
        self.store.view(|tx| tx.get_info(key)).map(|(_, info, _)| info)
    }

    /// Update labels; see [`crate::metadata::Txn::update_info`] for field paths.
    pub fn update(&self, info: &SnapshotInfo, fieldpaths: &[&str]) -> ImgResult<SnapshotInfo> {
        self.store.update(|tx| tx.update_info(info, fieldpaths))
    }

    /// Usage of an active snapshot is measured now; committed snapshots
    /// report what was recorded at commit time.
    pub fn usage(&self, key: &str) -> ImgResult<Usage> {
        let (id, info, usage) = self.store.view(|tx| tx.get_info(key))?;
        if info.kind == Kind::Active {
            return usage::disk_usage(&self.active_dir(&id));
        }
        Ok(usage)
    }

    /// Create a writable child of `parent` (empty for a root snapshot).
    pub fn prepare(&self, key: &str, parent: &str) -> ImgResult<Vec<Mount>> {
        self.create_snapshot(Kind::Active, key, parent)
    }

    /// Create a read-only view of `parent` (empty for an empty view).
    pub fn view(&self, key: &str, parent: &str) -> ImgResult<Vec<Mount>> {
        self.create_snapshot(Kind::View, key, parent)
    }

    /// Mounts of an existing active or view snapshot.
    pub fn mounts(&self, key: &str) -> ImgResult<Vec<Mount>> {
        let snapshot = self.store.view(|tx| tx.get_snapshot(key))?;
        Ok(self.mounts_for(&snapshot))
    }

    /// Commit the active snapshot `key` as `name`.
    pub fn commit(&self, name: &str, key: &str) -> ImgResult<()> {
        let (id, info, _) = self.store.view(|tx| tx.get_info(key))?;
        if info.kind != Kind::Active {
            return Err(ImgError::InvalidState(format!(
                "snapshot {} is {}, not active",
                key, info.kind
            )));
        }

        let active = self.active_dir(&id);
        let usage = usage::disk_usage(&active)?;

        let tx = self.store.begin_write()?;
        let committed = tx.commit_active(key, name, usage, &BTreeMap::new())?;
        if committed != id {
            return Err(ImgError::InvalidState(format!(
                "snapshot {} changed while committing",
                key
            )));
        }

        let target = self.snapshot_dir(&id);
        fs::rename(&active, &target).map_err(|e| {
            ImgError::Storage(format!(
                "failed to rename {} to {}: {}",
                active.display(),
                target.display(),
                e
            ))
        })?;

        if let Err(e) = tx.commit() {
            if let Err(re) = fs::rename(&target, &active) {
                tracing::error!(
                    path = %target.display(),
                    error = %re,
                    "Failed to undo rename after failed commit"
                );
            }
            return Err(e);
        }

        tracing::debug!(key, name, id = %id, size = usage.size, "Committed snapshot");
        Ok(())
    }

    /// Remove the snapshot `key` and its directory.
    pub fn remove(&self, key: &str) -> ImgResult<()> {
        let tx = self.store.begin_write()?;
        let record = tx.remove(key)?;
        let id = record.id_string();

        let mut renamed = None;
        if let Some(dir) = self.own_dir(&record) {
            let marker = self.snapshots_dir().join(format!("{}{}", dirs::REMOVED_PREFIX, id));
            match fs::rename(&dir, &marker) {
                Ok(()) => renamed = Some((dir, marker)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ImgError::Storage(format!(
                        "failed to rename {}: {}",
                        dir.display(),
                        e
                    )));
                }
            }
        }

        if let Err(e) = tx.commit() {
            if let Some((dir, marker)) = &renamed
                && let Err(re) = fs::rename(marker, dir)
            {
                tracing::error!(
                    path = %marker.display(),
                    error = %re,
                    "Failed to undo rename after failed commit"
                );
            }
            return Err(e);
        }

        if let Some((_, marker)) = renamed
            && let Err(e) = fs::remove_dir_all(&marker)
        {
            tracing::warn!(path = %marker.display(), error = %e, "Failed to delete removed snapshot");
        }

        tracing::debug!(key, id = %id, kind = %record.info.kind, "Removed snapshot");
        Ok(())
    }

    /// Visit every committed snapshot under one read transaction.
    pub fn walk(&self, f: impl FnMut(&SnapshotInfo) -> ImgResult<()>) -> ImgResult<()> {
        self.store.view(|tx| tx.walk_info(f))
    }

    /// Every record with its recorded usage, any kind.
    pub fn list(&self) -> ImgResult<Vec<Record>> {
        self.store.view(|tx| tx.records())
    }

    /// Ancestors of `key`, nearest first.
    pub fn parent_chain(&self, key: &str) -> ImgResult<Vec<SnapshotInfo>> {
        self.store.view(|tx| {
            let (id, _, _) = tx.get_info(key)?;
            tx.parent_chain(&id)?
                .into_iter()
                .map(|(_, parent)| tx.get_info(&parent).map(|(_, info, _)| info))
                .collect()
        })
    }

    /// Directory of the committed snapshot `name`.
    pub fn committed_dir(&self, name: &str) -> ImgResult<PathBuf> {
        let (id, info, _) = self.store.view(|tx| tx.get_info(name))?;
        if info.kind != Kind::Committed {
            return Err(ImgError::InvalidState(format!(
                "snapshot {} is {}, not committed",
                name, info.kind
            )));
        }
        Ok(self.snapshot_dir(&id))
    }

    /// Crash-recovery sweep.
    ///
    /// Deletes materialization temps, removal markers and directories with
    /// no record, and renames a committed-looking directory back to its
    /// active name when the commit never reached the store. Must not run
    /// concurrently with other operations on the same root.
    pub fn reconcile(&self) -> ImgResult<ReconcileReport> {
        let records = self.list()?;
        let mut expected: HashMap<PathBuf, &Record> = HashMap::new();
        for record in &records {
            if let Some(dir) = self.own_dir(record) {
                expected.insert(dir, record);
            }
        }

        let mut report = ReconcileReport::default();
        let snapshots = self.snapshots_dir();
        let entries = fs::read_dir(&snapshots).map_err(|e| {
            ImgError::Storage(format!("failed to read {}: {}", snapshots.display(), e))
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| {
                ImgError::Storage(format!("failed to read {}: {}", snapshots.display(), e))
            })?;
            let path = entry.path();
            if expected.contains_key(&path) {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let active = snapshots.join(format!("{}{}", dirs::ACTIVE_PREFIX, name));
            if let Some(record) = expected.get(&active)
                && record.info.kind == Kind::Active
                && !active.exists()
            {
                fs::rename(&path, &active).map_err(|e| {
                    ImgError::Storage(format!("failed to restore {}: {}", path.display(), e))
                })?;
                tracing::info!(path = %active.display(), "Restored active snapshot directory");
                report.restored.push(active);
                continue;
            }

            remove_path(&path)?;
            tracing::info!(path = %path.display(), "Removed orphaned snapshot directory");
            report.removed.push(path);
        }

        Ok(report)
    }

    fn create_snapshot(&self, kind: Kind, key: &str, parent: &str) -> ImgResult<Vec<Mount>> {
        let parent = (!parent.is_empty()).then_some(parent);

        // Committed content never changes, so the copy runs outside the
        // write transaction.
        let parent_id = match parent {
            Some(parent) if kind == Kind::Active => {
                let (id, info, _) = self.store.view(|tx| tx.get_info(parent)).map_err(|e| {
                    match e {
                        ImgError::NotFound(_) => {
                            ImgError::NotFound(format!("parent snapshot {}", parent))
                        }
                        other => other,
                    }
                })?;
                if info.kind != Kind::Committed {
                    return Err(ImgError::InvalidState(format!(
                        "parent {} is not committed",
                        parent
                    )));
                }
                Some(id)
            }
            _ => None,
        };

        let temp = if kind == Kind::Active || parent.is_none() {
            let temp = tempfile::Builder::new()
                .prefix(dirs::NEW_PREFIX)
                .tempdir_in(self.snapshots_dir())
                .map_err(|e| ImgError::Storage(format!("failed to create temp dir: {}", e)))?;
            match &parent_id {
                Some(id) => copy::copy_dir(&self.snapshot_dir(id), temp.path(), self.copy_options)?,
                None => fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o755))
                    .map_err(|e| {
                        ImgError::Storage(format!(
                            "failed to chmod {}: {}",
                            temp.path().display(),
                            e
                        ))
                    })?,
            }
            Some(temp)
        } else {
            None
        };

        let tx = self.store.begin_write()?;
        let snapshot = tx.create_snapshot(kind, key, parent, &BTreeMap::new())?;
        if parent_id.is_some() && snapshot.parent_ids.first() != parent_id.as_ref() {
            return Err(ImgError::InvalidState(format!(
                "parent of {} changed while preparing",
                key
            )));
        }

        let mut renamed = None;
        if let Some(temp) = &temp {
            let path = match kind {
                Kind::Active => self.active_dir(&snapshot.id),
                _ => self.view_dir(&snapshot.id),
            };
            fs::rename(temp.path(), &path).map_err(|e| {
                ImgError::Storage(format!(
                    "failed to rename {} to {}: {}",
                    temp.path().display(),
                    path.display(),
                    e
                ))
            })?;
            renamed = Some(path);
        }

        if let Err(e) = tx.commit() {
            if let Some(path) = renamed
                && let Err(re) = fs::remove_dir_all(&path)
            {
                tracing::warn!(path = %path.display(), error = %re, "Failed to clean up after failed commit");
            }
            return Err(e);
        }

        tracing::debug!(key, parent = ?parent, id = %snapshot.id, %kind, "Created snapshot");
        Ok(self.mounts_for(&snapshot))
    }

    /// A view is read-only. The source is the snapshot's own directory, or
    /// its parent's for a view that has no content of its own.
    fn mounts_for(&self, snapshot: &Snapshot) -> Vec<Mount> {
        let readonly = snapshot.kind == Kind::View;
        let source = match (snapshot.kind, snapshot.parent_ids.first()) {
            (Kind::Active, _) => self.active_dir(&snapshot.id),
            (_, None) => self.view_dir(&snapshot.id),
            (_, Some(parent)) => self.snapshot_dir(parent),
        };
        vec![Mount::bind(source, readonly)]
    }

    fn own_dir(&self, record: &Record) -> Option<PathBuf> {
        let id = record.id_string();
        match record.info.kind {
            Kind::Active => Some(self.active_dir(&id)),
            Kind::Committed => Some(self.snapshot_dir(&id)),
            Kind::View if record.info.parent.is_none() => Some(self.view_dir(&id)),
            Kind::View => None,
        }
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join(dirs::SNAPSHOTS)
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir().join(id)
    }

    fn active_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir()
            .join(format!("{}{}", dirs::ACTIVE_PREFIX, id))
    }

    fn view_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir()
            .join(format!("{}{}", dirs::VIEW_PREFIX, id))
    }
}

fn remove_path(path: &Path) -> ImgResult<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| ImgError::Storage(format!("failed to remove {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests;
