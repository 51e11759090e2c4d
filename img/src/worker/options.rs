//! Configuration for [`super::Worker`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use img_shared::constants::{backends, envs, runtime};

use crate::executor::RootfsMode;
use crate::mount::DiffStrategy;

const STATE_DIR_NAME: &str = "img";
const FALLBACK_STATE_DIR: &str = "/tmp/img";

/// Backend name accepted as an alias for the default backend.
pub const AUTO_BACKEND: &str = "auto";

/// Configuration options for a worker.
///
/// Create it with defaults and modify fields as needed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImgOptions {
    /// Root of all persisted state.
    ///
    /// Default: `$IMG_STATE_DIR`, else `$XDG_RUNTIME_DIR/img` when
    /// unprivileged, else `/tmp/img`.
    pub state_dir: PathBuf,

    /// Snapshot backend. Only `native` is built in; `auto` selects it.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Container runtime binary. Default: `$IMG_RUNTIME`, else `runc`.
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Run steps under the rootless spec. Default: effective uid is not 0
    /// or the process was re-executed into a user namespace.
    #[serde(default = "default_rootless")]
    pub rootless: bool,

    /// Default: `Direct` when rootless, `BindMount` otherwise.
    #[serde(default)]
    pub rootfs_mode: Option<RootfsMode>,

    #[serde(default)]
    pub diff_strategy: DiffStrategy,
}

impl ImgOptions {
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }

    /// Backend name after alias resolution.
    pub fn backend_name(&self) -> &str {
        match self.backend.as_str() {
            "" | AUTO_BACKEND => backends::NATIVE,
            other => other,
        }
    }

    pub fn effective_rootfs_mode(&self) -> RootfsMode {
        self.rootfs_mode.unwrap_or(if self.rootless {
            RootfsMode::Direct
        } else {
            RootfsMode::BindMount
        })
    }
}

impl Default for ImgOptions {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            backend: default_backend(),
            runtime: default_runtime(),
            rootless: default_rootless(),
            rootfs_mode: None,
            diff_strategy: DiffStrategy::default(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(envs::STATE_DIR) {
        return PathBuf::from(dir);
    }
    if default_rootless()
        && let Some(runtime_dir) = dirs::runtime_dir()
    {
        return runtime_dir.join(STATE_DIR_NAME);
    }
    PathBuf::from(FALLBACK_STATE_DIR)
}

fn default_backend() -> String {
    AUTO_BACKEND.to_string()
}

fn default_runtime() -> String {
    std::env::var(envs::RUNTIME).unwrap_or_else(|_| runtime::DEFAULT_BINARY.to_string())
}

/// Unprivileged, or root only inside the re-exec user namespace.
fn default_rootless() -> bool {
    !nix::unistd::geteuid().is_root() || std::env::var_os(envs::IN_UNSHARE).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_alias() {
        let mut opts = ImgOptions::with_state_dir("/tmp/x");
        assert_eq!(opts.backend_name(), "native");
        opts.backend = "overlay".into();
        assert_eq!(opts.backend_name(), "overlay");
    }

    #[test]
    fn test_rootfs_mode_follows_rootless() {
        let mut opts = ImgOptions::with_state_dir("/tmp/x");
        opts.rootless = true;
        assert_eq!(opts.effective_rootfs_mode(), RootfsMode::Direct);
        opts.rootless = false;
        assert_eq!(opts.effective_rootfs_mode(), RootfsMode::BindMount);
        opts.rootfs_mode = Some(RootfsMode::Direct);
        assert_eq!(opts.effective_rootfs_mode(), RootfsMode::Direct);
    }

    #[test]
    fn test_deserialize_minimal() {
        let opts: ImgOptions = serde_json::from_str(r#"{"state_dir":"/var/lib/img"}"#).unwrap();
        assert_eq!(opts.state_dir, PathBuf::from("/var/lib/img"));
        assert_eq!(opts.backend, "auto");
        assert_eq!(opts.diff_strategy, DiffStrategy::DirectCompare);
        assert!(opts.rootfs_mode.is_none());
    }
}
