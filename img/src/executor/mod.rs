//! Running one build step as an isolated process.
//!
//! An [`Executor`] takes a root filesystem, extra mounts and the step's
//! command, and runs it to completion. [`RuncExecutor`] does this by writing
//! an OCI bundle and invoking a runtime binary on it.

mod bundle;
mod runc;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use img_shared::ImgResult;

use crate::mount::{Mount, OPT_RO, OPT_RW};

pub use runc::{ExecutorOptions, RuncExecutor};

/// Anything that can be turned into mount descriptors: a snapshot, a cache
/// directory, a test fixture.
pub trait Mountable: Send + Sync + fmt::Debug {
    fn mount(&self) -> ImgResult<Vec<Mount>>;

    fn is_readonly(&self) -> bool;
}

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub args: Vec<String>,
    pub env: Vec<String>,
    /// Working directory inside the root. Empty means `/`.
    #[serde(default)]
    pub cwd: String,
    /// `user[:group]`, by name or id. Empty means root.
    #[serde(default)]
    pub user: String,
}

/// An additional mount at `target` inside the step's root.
#[derive(Debug, Clone)]
pub struct ExecMount {
    pub target: PathBuf,
    pub source: Arc<dyn Mountable>,
    pub readonly: bool,
}

impl ExecMount {
    pub fn new(target: impl Into<PathBuf>, source: Arc<dyn Mountable>, readonly: bool) -> Self {
        Self {
            target: target.into(),
            source,
            readonly,
        }
    }

    /// Descriptors for this mount, forced read-only when requested.
    pub fn resolve(&self) -> ImgResult<Vec<Mount>> {
        let mut mounts = self.source.mount()?;
        if self.readonly || self.source.is_readonly() {
            for m in &mut mounts {
                m.options.retain(|o| o != OPT_RW);
                if !m.is_readonly() {
                    m.options.insert(0, OPT_RO.to_string());
                }
            }
        }
        Ok(mounts)
    }
}

/// The step's standard streams. A missing stream is connected to
/// `/dev/null`.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ProcessIo {
    pub fn null() -> Self {
        Self::default()
    }

    /// Inherit nothing, forward output to this process's stdout and stderr.
    pub fn forward_output() -> Self {
        Self {
            stdin: None,
            stdout: Some(Box::new(tokio::io::stdout())),
            stderr: Some(Box::new(tokio::io::stderr())),
        }
    }
}

impl fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// How the root reaches the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootfsMode {
    /// Bind the root mounts onto `{bundle}/rootfs`.
    #[default]
    BindMount,
    /// Hand the snapshot directory to the runtime as is. Works without a
    /// mount namespace.
    Direct,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `meta` on `root` until it exits or `cancel` fires.
    ///
    /// A non-zero exit is [`img_shared::ImgError::ExecutionFailed`], or
    /// [`img_shared::ImgError::Cancelled`] when `cancel` fired first.
    async fn exec(
        &self,
        cancel: CancellationToken,
        meta: Meta,
        root: &dyn Mountable,
        mounts: &[ExecMount],
        io: ProcessIo,
    ) -> ImgResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fixed(bool);

    impl Mountable for Fixed {
        fn mount(&self) -> ImgResult<Vec<Mount>> {
            Ok(vec![Mount::bind("/src", self.0)])
        }

        fn is_readonly(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_exec_mount_forced_readonly() {
        let rw = ExecMount::new("/cache", Arc::new(Fixed(false)), false);
        assert!(!rw.resolve().unwrap()[0].is_readonly());

        let forced = ExecMount::new("/cache", Arc::new(Fixed(false)), true);
        let mounts = forced.resolve().unwrap();
        assert!(mounts[0].is_readonly());
        assert!(!mounts[0].options.iter().any(|o| o == OPT_RW));

        let ro = ExecMount::new("/cache", Arc::new(Fixed(true)), false);
        assert_eq!(ro.resolve().unwrap()[0].options, vec!["ro", "rbind"]);
    }

    #[test]
    fn test_meta_deserialize_defaults() {
        let meta: Meta = serde_json::from_str(r#"{"args":["true"],"env":[]}"#).unwrap();
        assert_eq!(meta.args, vec!["true"]);
        assert!(meta.cwd.is_empty());
        assert!(meta.user.is_empty());
    }

    #[test]
    fn test_rootfs_mode_serde() {
        assert_eq!(
            serde_json::to_string(&RootfsMode::Direct).unwrap(),
            "\"direct\""
        );
        assert_eq!(RootfsMode::default(), RootfsMode::BindMount);
    }
}
