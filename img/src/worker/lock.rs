//! Process-level lock on the state directory.
//!
//! Two `img` processes sharing a state directory would race on snapshot
//! directories and the metadata store, so the first one to open it holds an
//! exclusive `flock` on `{state}/.lock` until it exits.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use img_shared::{ImgError, ImgResult};

/// Exclusive lock on a state directory, released on drop or process exit.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Take the lock without blocking.
    pub fn acquire(lock_path: &Path) -> ImgResult<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ImgError::Storage(format!(
                    "failed to create state dir {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| ImgError::Storage(format!("failed to open lock file: {}", e)))?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(ImgError::Config(format!(
                    "state directory {} is in use by another img process",
                    lock_path.parent().unwrap_or(lock_path).display()
                )));
            }
            return Err(ImgError::Storage(format!(
                "failed to acquire lock: {}",
                err
            )));
        }

        tracing::debug!(lock_path = %lock_path.display(), "Acquired state lock");
        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(lock_path = %self.path.display(), "Released state lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state/.lock");

        let lock = StateLock::acquire(&path).unwrap();
        assert!(lock.path().exists());

        let err = StateLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("in use by another img process"));

        drop(lock);
        assert!(StateLock::acquire(&path).is_ok());
    }
}
