//! Directory diff and layer tarballs.
//!
//! [`compare`] computes the changes between a snapshot and its parent,
//! [`write_layer`] serializes them as a gzip-compressed OCI layer and
//! [`apply_layer`] unpacks such a layer into a snapshot directory.

mod apply;
mod layer;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use img_shared::{ImgError, ImgResult};

pub use apply::apply_layer;
pub use layer::{LayerDescriptor, write_layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

/// One changed path, relative to the compared roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl Change {
    fn new(kind: ChangeKind, path: PathBuf) -> Self {
        Self { kind, path }
    }
}

/// Changes that turn `lower` into `upper`, parents before children.
///
/// A deleted directory is reported once; its children are implied. An added
/// directory is followed by all of its contents.
pub fn compare(lower: &Path, upper: &Path) -> ImgResult<Vec<Change>> {
    let mut changes = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(rel) = pending.pop() {
        let lower_entries = read_entries(&lower.join(&rel))?;
        let upper_entries = read_entries(&upper.join(&rel))?;

        for name in lower_entries.keys() {
            if !upper_entries.contains_key(name) {
                changes.push(Change::new(ChangeKind::Delete, rel.join(name)));
            }
        }

        for (name, upper_meta) in &upper_entries {
            let path = rel.join(name);
            match lower_entries.get(name) {
                None => {
                    changes.push(Change::new(ChangeKind::Add, path.clone()));
                    if upper_meta.is_dir() {
                        add_subtree(upper, &path, &mut changes)?;
                    }
                }
                Some(lower_meta) if lower_meta.is_dir() && upper_meta.is_dir() => {
                    if !same_dir(lower_meta, upper_meta) {
                        changes.push(Change::new(ChangeKind::Modify, path.clone()));
                    }
                    pending.push(path);
                }
                Some(lower_meta) => {
                    if lower_meta.file_type() != upper_meta.file_type() {
                        changes.push(Change::new(ChangeKind::Modify, path.clone()));
                        if upper_meta.is_dir() {
                            add_subtree(upper, &path, &mut changes)?;
                        }
                    } else if !same_file(
                        &lower.join(&path),
                        lower_meta,
                        &upper.join(&path),
                        upper_meta,
                    )? {
                        changes.push(Change::new(ChangeKind::Modify, path));
                    }
                }
            }
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

fn read_entries(dir: &Path) -> ImgResult<BTreeMap<OsString, Metadata>> {
    let mut entries = BTreeMap::new();
    let iter = fs::read_dir(dir)
        .map_err(|e| ImgError::Storage(format!("failed to read {}: {}", dir.display(), e)))?;
    for entry in iter {
        let entry =
            entry.map_err(|e| ImgError::Storage(format!("failed to read {}: {}", dir.display(), e)))?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)
            .map_err(|e| ImgError::Storage(format!("failed to stat {}: {}", path.display(), e)))?;
        entries.insert(entry.file_name(), meta);
    }
    Ok(entries)
}

fn add_subtree(root: &Path, rel: &Path, changes: &mut Vec<Change>) -> ImgResult<()> {
    let base = root.join(rel);
    for entry in walkdir::WalkDir::new(&base).min_depth(1).follow_links(false) {
        let entry = entry
            .map_err(|e| ImgError::Storage(format!("failed to walk {}: {}", base.display(), e)))?;
        let sub = entry.path().strip_prefix(root).map_err(|e| {
            ImgError::Storage(format!("failed to rebase {}: {}", entry.path().display(), e))
        })?;
        changes.push(Change::new(ChangeKind::Add, sub.to_path_buf()));
    }
    Ok(())
}

fn same_dir(a: &Metadata, b: &Metadata) -> bool {
    a.mode() == b.mode() && a.uid() == b.uid() && a.gid() == b.gid()
}

fn same_file(a_path: &Path, a: &Metadata, b_path: &Path, b: &Metadata) -> ImgResult<bool> {
    if a.mode() != b.mode()
        || a.uid() != b.uid()
        || a.gid() != b.gid()
        || a.size() != b.size()
        || a.mtime() != b.mtime()
        || a.mtime_nsec() != b.mtime_nsec()
        || a.rdev() != b.rdev()
    {
        return Ok(false);
    }
    if a.file_type().is_symlink() {
        let read = |p: &Path| {
            fs::read_link(p)
                .map_err(|e| ImgError::Storage(format!("failed to read link {}: {}", p.display(), e)))
        };
        return Ok(read(a_path)? == read(b_path)?);
    }
    Ok(true)
}
