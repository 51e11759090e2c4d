//! Streaming layer applier.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, trace};

use img_shared::{ImgError, ImgResult};

const OPAQUE_MARKER: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

struct DeferredDir {
    path: PathBuf,
    mode: u32,
    mtime: u64,
}

/// Unpack a layer tarball into `dest`, which must exist.
///
/// The stream may be gzip-compressed or plain. Whiteouts delete the named
/// path, opaque markers clear everything in their directory that this layer
/// did not itself add. Returns the total uncompressed payload size.
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> ImgResult<u64> {
    let mut buffered = BufReader::new(reader);
    let head = buffered
        .fill_buf()
        .map_err(|e| ImgError::Storage(format!("failed to read layer header: {}", e)))?;

    let stream: Box<dyn Read> = if head.starts_with(&[0x1f, 0x8b]) {
        debug!(dest = %dest.display(), "Applying gzip layer");
        Box::new(GzDecoder::new(buffered))
    } else {
        debug!(dest = %dest.display(), "Applying uncompressed layer");
        Box::new(buffered)
    };

    let is_root = unsafe { libc::geteuid() } == 0;
    let mut archive = Archive::new(stream);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(is_root);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut dirs: Vec<DeferredDir> = Vec::new();
    let mut total = 0u64;

    let entries = archive
        .entries()
        .map_err(|e| ImgError::Storage(format!("failed to read layer entries: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| ImgError::Storage(format!("failed to read layer entry: {}", e)))?;
        let raw = entry
            .path()
            .map_err(|e| ImgError::Storage(format!("invalid layer entry path: {}", e)))?
            .into_owned();
        let rel = normalize_entry_path(&raw).ok_or_else(|| {
            ImgError::Storage(format!("layer entry escapes destination: {}", raw.display()))
        })?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let full = dest.join(&rel);
        let entry_type = entry.header().entry_type();
        total = total.saturating_add(entry.header().size().unwrap_or(0));

        if entry_type == EntryType::XGlobalHeader {
            continue;
        }
        if handle_whiteout(&full, &unpacked)? {
            continue;
        }

        ensure_parent_dirs(dest, &full)?;
        remove_existing_if_needed(&full, entry_type)?;

        if entry_type == EntryType::Directory {
            if !full.is_dir() {
                fs::create_dir(&full).map_err(|e| {
                    ImgError::Storage(format!("failed to create {}: {}", full.display(), e))
                })?;
            }
            dirs.push(DeferredDir {
                path: full.clone(),
                mode: entry.header().mode().unwrap_or(0o755),
                mtime: entry.header().mtime().unwrap_or(0),
            });
            if is_root {
                let uid = entry.header().uid().unwrap_or(0) as u32;
                let gid = entry.header().gid().unwrap_or(0) as u32;
                std::os::unix::fs::lchown(&full, Some(uid), Some(gid)).map_err(|e| {
                    ImgError::Storage(format!("failed to chown {}: {}", full.display(), e))
                })?;
            }
        } else if matches!(entry_type, EntryType::Block | EntryType::Char) && !is_root {
            trace!(path = %full.display(), "Skipping device node");
            continue;
        } else {
            let unpacked_in = entry.unpack_in(dest).map_err(|e| {
                ImgError::Storage(format!("failed to unpack {}: {}", rel.display(), e))
            })?;
            if !unpacked_in {
                return Err(ImgError::Storage(format!(
                    "layer entry escapes destination: {}",
                    raw.display()
                )));
            }
        }

        unpacked.insert(full);
    }

    // Deepest first so a restrictive parent cannot block its children.
    dirs.sort_unstable_by(|a, b| b.path.cmp(&a.path));
    for dir in &dirs {
        if !dir.path.exists() {
            continue;
        }
        fs::set_permissions(&dir.path, fs::Permissions::from_mode(dir.mode & 0o7777)).map_err(
            |e| ImgError::Storage(format!("failed to chmod {}: {}", dir.path.display(), e)),
        )?;
        let mtime = FileTime::from_unix_time(dir.mtime as i64, 0);
        filetime::set_file_times(&dir.path, mtime, mtime).map_err(|e| {
            ImgError::Storage(format!("failed to set times on {}: {}", dir.path.display(), e))
        })?;
    }

    debug!(dest = %dest.display(), entries = unpacked.len(), total, "Applied layer");
    Ok(total)
}

/// Lexically resolve `path` relative to the layer root. `None` when a `..`
/// climbs above it.
fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(c) => components.push(c.to_os_string()),
        }
    }
    Some(components.into_iter().collect())
}

/// Create the parents of `path`, refusing to pass through symlinks.
fn ensure_parent_dirs(root: &Path, path: &Path) -> ImgResult<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let rel = parent.strip_prefix(root).map_err(|e| {
        ImgError::Storage(format!("failed to rebase {}: {}", parent.display(), e))
    })?;

    let mut current = root.to_path_buf();
    for comp in rel.components() {
        current.push(comp);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ImgError::Storage(format!(
                    "layer entry {} traverses symlink {}",
                    path.display(),
                    current.display()
                )));
            }
            Ok(_) => {
                trace!(path = %current.display(), "Replacing non-directory parent");
                fs::remove_file(&current).map_err(|e| {
                    ImgError::Storage(format!("failed to remove {}: {}", current.display(), e))
                })?;
                create_dir(&current)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => create_dir(&current)?,
            Err(e) => {
                return Err(ImgError::Storage(format!(
                    "failed to stat {}: {}",
                    current.display(),
                    e
                )));
            }
        }
    }
    Ok(())
}

fn create_dir(path: &Path) -> ImgResult<()> {
    fs::create_dir(path)
        .map_err(|e| ImgError::Storage(format!("failed to create {}: {}", path.display(), e)))
}

fn handle_whiteout(path: &Path, unpacked: &HashSet<PathBuf>) -> ImgResult<bool> {
    let Some(base) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };

    if base == OPAQUE_MARKER {
        if let Some(dir) = path.parent() {
            apply_opaque_whiteout(dir, unpacked)?;
        }
        return Ok(true);
    }

    if let Some(name) = base.strip_prefix(WHITEOUT_PREFIX) {
        if let Some(parent) = path.parent() {
            remove_path(&parent.join(name))?;
            debug!(path = %parent.join(name).display(), "Whiteout removed");
        }
        return Ok(true);
    }

    Ok(false)
}

fn apply_opaque_whiteout(dir: &Path, unpacked: &HashSet<PathBuf>) -> ImgResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(ImgError::Storage(format!(
                "failed to read {}: {}",
                dir.display(),
                e
            )));
        }
    };

    for entry in entries {
        let entry = entry
            .map_err(|e| ImgError::Storage(format!("failed to read {}: {}", dir.display(), e)))?;
        let path = entry.path();
        let from_this_layer = unpacked.iter().any(|p| p.starts_with(&path));
        if !from_this_layer {
            remove_path(&path)?;
        }
    }
    Ok(())
}

fn remove_existing_if_needed(path: &Path, entry_type: EntryType) -> ImgResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() && entry_type == EntryType::Directory => Ok(()),
        Ok(_) => remove_path(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ImgError::Storage(format!(
            "failed to stat {}: {}",
            path.display(),
            e
        ))),
    }
}

fn remove_path(path: &Path) -> ImgResult<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| ImgError::Storage(format!("failed to remove {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct LayerBuilder {
        builder: tar::Builder<Vec<u8>>,
    }

    impl LayerBuilder {
        fn new() -> Self {
            Self {
                builder: tar::Builder::new(Vec::new()),
            }
        }

        fn dir(mut self, path: &str, mode: u32) -> Self {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(mode);
            self.builder
                .append_data(&mut header, path, io::empty())
                .unwrap();
            self
        }

        fn file(mut self, path: &str, content: &str) -> Self {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            self.builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
            self
        }

        fn raw_path(mut self, path: &str) -> Self {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(0);
            header.set_mode(0o644);
            let name = header.as_old_mut();
            name.name[..path.len()].copy_from_slice(path.as_bytes());
            header.set_cksum();
            self.builder.append(&header, io::empty()).unwrap();
            self
        }

        fn finish(self) -> Vec<u8> {
            self.builder.into_inner().unwrap()
        }

        fn finish_gzip(self) -> Vec<u8> {
            use std::io::Write;
            let raw = self.finish();
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
            enc.write_all(&raw).unwrap();
            enc.finish().unwrap()
        }
    }

    #[test]
    fn test_apply_plain_and_gzip() {
        let dest = TempDir::new().unwrap();
        let layer = LayerBuilder::new().dir("etc", 0o755).file("etc/a", "one");
        apply_layer(layer.finish().as_slice(), dest.path()).unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("etc/a")).unwrap(), "one");

        let layer = LayerBuilder::new().file("etc/b", "two");
        let size = apply_layer(layer.finish_gzip().as_slice(), dest.path()).unwrap();
        assert_eq!(size, 3);
        assert_eq!(fs::read_to_string(dest.path().join("etc/b")).unwrap(), "two");
    }

    #[test]
    fn test_whiteout_removes_file_and_dir() {
        let dest = TempDir::new().unwrap();
        fs::write(dest.path().join("gone"), "x").unwrap();
        fs::create_dir_all(dest.path().join("dir/sub")).unwrap();

        let layer = LayerBuilder::new().file(".wh.gone", "").file(".wh.dir", "");
        apply_layer(layer.finish().as_slice(), dest.path()).unwrap();

        assert!(!dest.path().join("gone").exists());
        assert!(!dest.path().join("dir").exists());
        assert!(!dest.path().join(".wh.gone").exists());
    }

    #[test]
    fn test_opaque_marker_keeps_entries_of_same_layer() {
        let dest = TempDir::new().unwrap();
        fs::create_dir(dest.path().join("d")).unwrap();
        fs::write(dest.path().join("d/old"), "x").unwrap();

        let layer = LayerBuilder::new()
            .dir("d", 0o755)
            .file("d/new", "y")
            .file("d/.wh..wh..opq", "");
        apply_layer(layer.finish().as_slice(), dest.path()).unwrap();

        assert!(!dest.path().join("d/old").exists());
        assert!(dest.path().join("d/new").exists());
    }

    #[test]
    fn test_readonly_dir_is_filled_before_chmod() {
        let dest = TempDir::new().unwrap();
        let layer = LayerBuilder::new().dir("ro", 0o555).file("ro/f", "z");
        apply_layer(layer.finish().as_slice(), dest.path()).unwrap();

        let mode = fs::metadata(dest.path().join("ro")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
        assert!(dest.path().join("ro/f").exists());
        fs::set_permissions(dest.path().join("ro"), fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_file_replaces_directory() {
        let dest = TempDir::new().unwrap();
        fs::create_dir_all(dest.path().join("x/inner")).unwrap();
        let layer = LayerBuilder::new().file("x", "now a file");
        apply_layer(layer.finish().as_slice(), dest.path()).unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("x")).unwrap(), "now a file");
    }

    #[test]
    fn test_escaping_entry_rejected() {
        let dest = TempDir::new().unwrap();
        let layer = LayerBuilder::new().raw_path("../evil");
        let err = apply_layer(layer.finish().as_slice(), dest.path()).unwrap_err();
        assert!(matches!(err, ImgError::Storage(msg) if msg.contains("escapes")));
    }

    #[test]
    fn test_symlink_parent_rejected() {
        let dest = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dest.path().join("link")).unwrap();

        let layer = LayerBuilder::new().file("link/passwd", "root::0:0");
        assert!(apply_layer(layer.finish().as_slice(), dest.path()).is_err());
        assert!(!outside.path().join("passwd").exists());
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(
            normalize_entry_path(Path::new("/a/./b/../c")),
            Some(PathBuf::from("a/c"))
        );
        assert_eq!(normalize_entry_path(Path::new("a/../../b")), None);
    }
}
