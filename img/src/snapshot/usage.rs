use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use img_shared::{ImgError, ImgResult};

use crate::metadata::Usage;

/// Disk usage of the tree rooted at `root`.
///
/// Counts every inode once, however many hard links point at it, and sums
/// the byte sizes of regular files.
pub fn disk_usage(root: &Path) -> ImgResult<Usage> {
    let mut seen = HashSet::new();
    let mut usage = Usage::default();

    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            ImgError::Storage(format!("failed to walk {}: {}", root.display(), e))
        })?;
        let metadata = entry.metadata().map_err(|e| {
            ImgError::Storage(format!("failed to stat {}: {}", entry.path().display(), e))
        })?;

        if !seen.insert((metadata.dev(), metadata.ino())) {
            continue;
        }
        usage.inodes += 1;
        if metadata.file_type().is_file() {
            usage.size += metadata.len() as i64;
        }
    }

    Ok(usage)
}
