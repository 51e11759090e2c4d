//! Symlink-safe path resolution inside a rootfs.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use img_shared::{ImgError, ImgResult};

/// Symlink hops allowed while resolving one path.
pub const MAX_SYMLINK_HOPS: usize = 255;

/// Resolve `path` as if `root` were `/`.
///
/// Symlinks are followed, but absolute targets restart at `root` and `..`
/// never climbs above it, so the result always lies under `root`. Missing
/// components are joined lexically.
pub fn root_path(root: &Path, path: impl AsRef<Path>) -> ImgResult<PathBuf> {
    let mut pending: VecDeque<OsString> = components(path.as_ref()).collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0usize;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }

        let candidate = resolved.join(&part);
        let full = root.join(&candidate);
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(ImgError::Storage(format!(
                        "too many levels of symbolic links resolving {} in {}",
                        path.as_ref().display(),
                        root.display()
                    )));
                }
                let target = fs::read_link(&full).map_err(|e| {
                    ImgError::Storage(format!("failed to read link {}: {}", full.display(), e))
                })?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                for (i, comp) in components(&target).enumerate() {
                    pending.insert(i, comp);
                }
            }
            Ok(_) => resolved = candidate,
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.raw_os_error() == Some(libc::ENOTDIR) =>
            {
                resolved = candidate
            }
            Err(e) => {
                return Err(ImgError::Storage(format!(
                    "failed to stat {}: {}",
                    full.display(),
                    e
                )));
            }
        }
    }

    Ok(root.join(resolved))
}

/// Normal and `..` components of `path`; root and `.` are dropped.
fn components(path: &Path) -> impl Iterator<Item = OsString> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(p) => Some(p.to_os_string()),
        Component::ParentDir => Some(OsString::from("..")),
        Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
    })
}
