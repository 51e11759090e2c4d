//! Eager directory copy used to materialize a child snapshot from its parent.
//!
//! Preserves file types, permissions, ownership, timestamps, selected
//! extended attributes and hard links. Sockets and device nodes are skipped:
//! they cannot be recreated without privileges and never belong in an image
//! layer anyway.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt, lchown, symlink};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;

use img_shared::{ImgError, ImgResult};

/// Inode identity for hard link detection.
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
struct FileId {
    dev: u64,
    ino: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    pub copy_xattrs: bool,
    /// Ownership cannot be preserved without privileges; rootless callers
    /// set this.
    pub ignore_chown_errors: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            copy_xattrs: true,
            ignore_chown_errors: !nix::unistd::geteuid().is_root(),
        }
    }
}

/// Copy the contents of `src` into the existing directory `dst`.
///
/// The root of `dst` takes over the mode, ownership and timestamps of
/// `src`.
pub fn copy_dir(src: &Path, dst: &Path, options: CopyOptions) -> ImgResult<()> {
    if !src.is_dir() {
        return Err(ImgError::Storage(format!(
            "copy source is not a directory: {}",
            src.display()
        )));
    }

    tracing::debug!(src = %src.display(), dst = %dst.display(), "Copying snapshot directory");

    let mut copied: HashMap<FileId, PathBuf> = HashMap::new();
    let mut dirs: Vec<DeferredDir> = Vec::new();

    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            ImgError::Storage(format!("failed to walk {}: {}", src.display(), e))
        })?;
        let src_path = entry.path();
        let rel = src_path.strip_prefix(src).map_err(|e| {
            ImgError::Storage(format!("failed to rebase {}: {}", src_path.display(), e))
        })?;
        let dst_path = dst.join(rel);

        let metadata = fs::symlink_metadata(src_path).map_err(|e| {
            ImgError::Storage(format!("failed to stat {}: {}", src_path.display(), e))
        })?;
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            if !rel.as_os_str().is_empty() {
                fs::create_dir(&dst_path).map_err(|e| {
                    ImgError::Storage(format!(
                        "failed to create directory {}: {}",
                        dst_path.display(),
                        e
                    ))
                })?;
            }
            dirs.push(DeferredDir {
                path: dst_path.clone(),
                mode: metadata.mode() & 0o7777,
                times: metadata.accessed().ok().zip(metadata.modified().ok()),
            });
        } else if file_type.is_file() {
            let id = FileId {
                dev: metadata.dev(),
                ino: metadata.ino(),
            };
            if metadata.nlink() > 1
                && let Some(first) = copied.get(&id)
            {
                fs::hard_link(first, &dst_path).map_err(|e| {
                    ImgError::Storage(format!(
                        "failed to link {} -> {}: {}",
                        dst_path.display(),
                        first.display(),
                        e
                    ))
                })?;
                // Shares the inode, metadata already applied.
                continue;
            }
            fs::copy(src_path, &dst_path).map_err(|e| {
                ImgError::Storage(format!(
                    "failed to copy {} -> {}: {}",
                    src_path.display(),
                    dst_path.display(),
                    e
                ))
            })?;
            if metadata.nlink() > 1 {
                copied.insert(id, dst_path.clone());
            }
        } else if file_type.is_symlink() {
            let target = fs::read_link(src_path).map_err(|e| {
                ImgError::Storage(format!("failed to read link {}: {}", src_path.display(), e))
            })?;
            symlink(&target, &dst_path).map_err(|e| {
                ImgError::Storage(format!(
                    "failed to create symlink {} -> {}: {}",
                    dst_path.display(),
                    target.display(),
                    e
                ))
            })?;
        } else if file_type.is_fifo() {
            create_fifo(&dst_path, metadata.mode())?;
        } else if file_type.is_socket() || file_type.is_block_device() || file_type.is_char_device()
        {
            tracing::debug!(path = %src_path.display(), "Skipping special file");
            continue;
        } else {
            return Err(ImgError::Storage(format!(
                "unknown file type: {}",
                src_path.display()
            )));
        }

        copy_metadata(src_path, &dst_path, &metadata, &options)?;
    }

    // Children first: a read-only directory must stay writable until its
    // contents are in place, and filling it would bump its mtime.
    for dir in dirs.iter().rev() {
        fs::set_permissions(&dir.path, fs::Permissions::from_mode(dir.mode)).map_err(|e| {
            ImgError::Storage(format!("failed to chmod {}: {}", dir.path.display(), e))
        })?;
        if let Some((atime, mtime)) = dir.times {
            set_times(&dir.path, atime, mtime)?;
        }
    }

    Ok(())
}

struct DeferredDir {
    path: PathBuf,
    mode: u32,
    times: Option<(SystemTime, SystemTime)>,
}

fn set_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> ImgResult<()> {
    filetime::set_symlink_file_times(
        path,
        FileTime::from_system_time(atime),
        FileTime::from_system_time(mtime),
    )
    .map_err(|e| ImgError::Storage(format!("failed to set times on {}: {}", path.display(), e)))
}

fn copy_metadata(
    src: &Path,
    dst: &Path,
    metadata: &fs::Metadata,
    options: &CopyOptions,
) -> ImgResult<()> {
    let file_type = metadata.file_type();

    // chown before chmod, it clears setuid bits.
    if let Err(e) = lchown(dst, Some(metadata.uid()), Some(metadata.gid())) {
        if !options.ignore_chown_errors {
            return Err(ImgError::Storage(format!(
                "failed to chown {}: {}",
                dst.display(),
                e
            )));
        }
        tracing::trace!(path = %dst.display(), error = %e, "Ignoring chown error");
    }

    if options.copy_xattrs {
        copy_xattrs(src, dst);
    }

    if !file_type.is_symlink() && !file_type.is_dir() {
        fs::set_permissions(dst, fs::Permissions::from_mode(metadata.mode() & 0o7777)).map_err(
            |e| ImgError::Storage(format!("failed to chmod {}: {}", dst.display(), e)),
        )?;
    }

    if !file_type.is_dir()
        && let (Ok(atime), Ok(mtime)) = (metadata.accessed(), metadata.modified())
    {
        set_times(dst, atime, mtime)?;
    }

    Ok(())
}

/// Copy the xattrs that matter inside an image: file capabilities, user
/// attributes and overlay opaque markers. Unsupported filesystems are fine.
fn copy_xattrs(src: &Path, dst: &Path) {
    let Ok(attrs) = xattr::list(src) else {
        return;
    };
    for attr in attrs {
        let name = attr.to_string_lossy();
        let wanted = name == "security.capability"
            || name == "trusted.overlay.opaque"
            || name.starts_with("user.");
        if wanted
            && let Ok(Some(value)) = xattr::get(src, &attr)
            && let Err(e) = xattr::set(dst, &attr, &value)
        {
            tracing::trace!(path = %dst.display(), attr = %name, error = %e, "Skipping xattr");
        }
    }
}

pub(crate) fn create_fifo(path: &Path, mode: u32) -> ImgResult<()> {
    nix::unistd::mkfifo(
        path,
        nix::sys::stat::Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t),
    )
    .map_err(|e| ImgError::Storage(format!("failed to create fifo {}: {}", path.display(), e)))
}
