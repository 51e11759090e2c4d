//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable shell script standing in for the OCI runtime.
///
/// The runtime is invoked as
/// `--log L --log-format json run --bundle B --no-new-keyring ID`, so the
/// bundle directory is `$7`. `body` runs with `$bundle` and `$root` (the
/// spec's root path) set.
pub fn fake_runtime(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-runc");
    let script = format!(
        r#"#!/bin/sh
bundle="$7"
root=$(grep -o '"path": *"[^"]*"' "$bundle/config.json" | head -n 1 | sed 's/.*"\([^"]*\)"$/\1/')
{body}
"#
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Directories left under `dir`.
pub fn subdirs(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect()
}
