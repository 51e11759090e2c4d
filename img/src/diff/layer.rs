use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use img_shared::{ImgError, ImgResult};

use super::{Change, ChangeKind};

const WHITEOUT_PREFIX: &str = ".wh.";

/// Identity of a written layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Digest of the compressed stream.
    pub digest: String,
    /// Digest of the uncompressed tar.
    pub diff_id: String,
    /// Compressed size in bytes.
    pub size: u64,
}

/// Writer adapter that hashes and counts everything passing through.
struct HashWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write `changes` of `upper` as a gzip-compressed tar layer.
///
/// Deletions become `.wh.<name>` whiteout entries. Sockets are skipped.
pub fn write_layer<W: Write>(
    upper: &Path,
    changes: &[Change],
    writer: W,
) -> ImgResult<LayerDescriptor> {
    let compressed = HashWriter::new(writer);
    let encoder = GzEncoder::new(compressed, Compression::default());
    let mut builder = tar::Builder::new(HashWriter::new(encoder));
    builder.follow_symlinks(false);

    for change in changes {
        match change.kind {
            ChangeKind::Delete => append_whiteout(&mut builder, &change.path)?,
            ChangeKind::Add | ChangeKind::Modify => {
                let full = upper.join(&change.path);
                let meta = fs::symlink_metadata(&full).map_err(|e| {
                    ImgError::Storage(format!("failed to stat {}: {}", full.display(), e))
                })?;
                if meta.file_type().is_socket() {
                    tracing::debug!(path = %full.display(), "Skipping socket");
                    continue;
                }
                builder
                    .append_path_with_name(&full, &change.path)
                    .map_err(|e| {
                        ImgError::Storage(format!(
                            "failed to append {} to layer: {}",
                            change.path.display(),
                            e
                        ))
                    })?;
            }
        }
    }

    let uncompressed = builder
        .into_inner()
        .map_err(|e| ImgError::Storage(format!("failed to finish layer tar: {}", e)))?;
    let (encoder, diff_id, _) = uncompressed.finish();
    let compressed = encoder
        .finish()
        .map_err(|e| ImgError::Storage(format!("failed to finish layer gzip: {}", e)))?;
    let (mut writer, digest, size) = compressed.finish();
    writer
        .flush()
        .map_err(|e| ImgError::Storage(format!("failed to flush layer: {}", e)))?;

    tracing::debug!(%digest, %diff_id, size, changes = changes.len(), "Wrote layer");
    Ok(LayerDescriptor {
        digest,
        diff_id,
        size,
    })
}

fn append_whiteout<W: Write>(builder: &mut tar::Builder<W>, path: &Path) -> ImgResult<()> {
    let name = path.file_name().ok_or_else(|| {
        ImgError::Storage(format!("cannot white out {}", path.display()))
    })?;
    let mut whiteout = std::ffi::OsString::from(WHITEOUT_PREFIX);
    whiteout.push(name);
    let entry = match path.parent() {
        Some(parent) => parent.join(whiteout),
        None => whiteout.into(),
    };

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder
        .append_data(&mut header, &entry, io::empty())
        .map_err(|e| {
            ImgError::Storage(format!(
                "failed to append whiteout {}: {}",
                entry.display(),
                e
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn entry_names(layer: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(layer));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_write_layer_with_whiteout() {
        let upper = TempDir::new().unwrap();
        fs::create_dir(upper.path().join("etc")).unwrap();
        fs::write(upper.path().join("etc/motd"), "hello").unwrap();

        let changes = vec![
            Change::new(ChangeKind::Delete, PathBuf::from("etc/old")),
            Change::new(ChangeKind::Modify, PathBuf::from("etc/motd")),
        ];
        let mut out = Vec::new();
        let desc = write_layer(upper.path(), &changes, &mut out).unwrap();

        assert_eq!(entry_names(&out), vec!["etc/.wh.old", "etc/motd"]);
        assert_eq!(desc.size, out.len() as u64);
        assert_eq!(
            desc.digest,
            format!("sha256:{}", hex::encode(Sha256::digest(&out)))
        );

        let mut raw = Vec::new();
        flate2::read::GzDecoder::new(out.as_slice())
            .read_to_end(&mut raw)
            .unwrap();
        assert_eq!(
            desc.diff_id,
            format!("sha256:{}", hex::encode(Sha256::digest(&raw)))
        );
    }

    #[test]
    fn test_top_level_whiteout() {
        let upper = TempDir::new().unwrap();
        let changes = vec![Change::new(ChangeKind::Delete, PathBuf::from("tmp"))];
        let mut out = Vec::new();
        write_layer(upper.path(), &changes, &mut out).unwrap();
        assert_eq!(entry_names(&out), vec![".wh.tmp"]);
    }
}
