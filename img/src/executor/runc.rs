use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use img_shared::constants::runtime;
use img_shared::layout::BundleLayout;
use img_shared::{ImgError, ImgResult};

use super::bundle::Bundle;
use super::{ExecMount, Executor, Meta, Mountable, ProcessIo, RootfsMode};
use crate::identity::IdMapping;
use crate::mount::Mount;
use crate::oci::{SpecMount, SpecOptions, build_spec, hosts_file, resolv_conf};
use crate::util::find_binary;
use crate::util::process::{exit_code, kill_process_group};

const RUNTIME_LOG: &str = "runc-log.json";
const LOG_TAIL_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Scratch directory holding bundles and resolver files.
    pub root: PathBuf,
    /// Runtime binary, a path or a name looked up on `PATH`.
    pub runtime: String,
    pub rootless: bool,
    pub rootfs_mode: RootfsMode,
    /// Mapping for the rootless user namespace.
    pub id_mapping: Option<IdMapping>,
}

impl ExecutorOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runtime: runtime::DEFAULT_BINARY.to_string(),
            rootless: !nix::unistd::geteuid().is_root(),
            rootfs_mode: RootfsMode::default(),
            id_mapping: None,
        }
    }
}

/// Executor backed by an OCI runtime binary (`runc` or compatible).
#[derive(Debug)]
pub struct RuncExecutor {
    opts: ExecutorOptions,
}

impl RuncExecutor {
    pub fn new(opts: ExecutorOptions) -> ImgResult<Self> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o711)
            .create(&opts.root)
            .map_err(|e| {
                ImgError::Storage(format!(
                    "failed to create executor root {}: {}",
                    opts.root.display(),
                    e
                ))
            })?;
        tracing::debug!(
            root = %opts.root.display(),
            runtime = %opts.runtime,
            rootless = opts.rootless,
            mode = ?opts.rootfs_mode,
            "Created executor"
        );
        Ok(Self { opts })
    }

    pub fn root(&self) -> &Path {
        &self.opts.root
    }

    fn runtime_log(&self) -> PathBuf {
        self.opts.root.join(RUNTIME_LOG)
    }

    async fn run_runtime(
        &self,
        runtime: &Path,
        layout: &BundleLayout,
        bundle_id: &str,
        cancel: &CancellationToken,
        io: ProcessIo,
    ) -> ImgResult<i32> {
        let mut cmd = Command::new(runtime);
        cmd.arg("--log")
            .arg(self.runtime_log())
            .args(["--log-format", "json", "run", "--bundle"])
            .arg(layout.dir())
            .arg("--no-new-keyring")
            .arg(bundle_id);
        cmd.stdin(piped_if(io.stdin.is_some()));
        cmd.stdout(piped_if(io.stdout.is_some()));
        cmd.stderr(piped_if(io.stderr.is_some()));
        cmd.kill_on_drop(true);

        // SAFETY: prctl and setpgid are async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            ImgError::Internal(format!("failed to start {}: {}", runtime.display(), e))
        })?;
        let pid = child.id();
        tracing::debug!(bundle_id, pid, "Started runtime");

        let mut pumps = Vec::new();
        if let (Some(mut reader), Some(mut writer)) = (io.stdin, child.stdin.take()) {
            pumps.push(tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                    tracing::debug!(error = %e, "stdin closed early");
                }
                let _ = writer.shutdown().await;
            }));
        }
        if let (Some(reader), Some(writer)) = (child.stdout.take(), io.stdout) {
            pumps.push(pump(reader, writer));
        }
        if let (Some(reader), Some(writer)) = (child.stderr.take(), io.stderr) {
            pumps.push(pump(reader, writer));
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status,
            None => {
                tracing::info!(bundle_id, "Step cancelled, killing runtime");
                if let Some(pid) = pid
                    && !kill_process_group(pid)
                {
                    tracing::warn!(bundle_id, pid, "Failed to kill runtime process group");
                }
                child.wait().await
            }
        }
        .map_err(|e| ImgError::Internal(format!("failed to wait for runtime: {}", e)))?;

        for handle in pumps {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "stdio forwarding task failed");
            }
        }

        Ok(exit_code(status))
    }

    fn log_runtime_failure(&self, bundle_id: &str, code: i32) {
        let tail = fs::read_to_string(self.runtime_log())
            .map(|log| {
                let lines: Vec<&str> = log.lines().collect();
                lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n")
            })
            .unwrap_or_default();
        tracing::warn!(bundle_id, code, log = %tail, "Runtime exited non-zero");
    }
}

#[async_trait]
impl Executor for RuncExecutor {
    async fn exec(
        &self,
        cancel: CancellationToken,
        meta: Meta,
        root: &dyn Mountable,
        mounts: &[ExecMount],
        io: ProcessIo,
    ) -> ImgResult<()> {
        let resolv = resolv_conf(&self.opts.root)?;
        let hosts = hosts_file(&self.opts.root)?;

        let root_mounts = root.mount()?;
        let bundle_id = uuid::Uuid::new_v4().simple().to_string();
        let mut bundle = Bundle::create(BundleLayout::new(&self.opts.root, &bundle_id))?;

        let rootfs = match self.opts.rootfs_mode {
            RootfsMode::BindMount => bundle.mount_rootfs(&root_mounts)?,
            RootfsMode::Direct => direct_source(&root_mounts)?,
        };

        let mut spec_mounts = Vec::new();
        for m in mounts {
            for mount in m.resolve()? {
                spec_mounts.push(SpecMount {
                    destination: m.target.clone(),
                    mount,
                });
            }
        }

        let spec_opts = SpecOptions {
            rootfs,
            readonly: root.is_readonly(),
            rootless: self.opts.rootless,
            id_mapping: self.opts.id_mapping.clone(),
        };
        let (spec, spec_cleanup) =
            build_spec(&meta, &spec_mounts, &bundle_id, &resolv, &hosts, &spec_opts)?;

        let config_path = bundle.layout().config_path();
        spec.save(&config_path).map_err(|e| {
            ImgError::SpecBuild(format!(
                "failed to write {}: {}",
                config_path.display(),
                e
            ))
        })?;

        let runtime = find_binary(&self.opts.runtime)?;
        tracing::info!(bundle_id, args = ?meta.args, "Running step");
        let result = self
            .run_runtime(&runtime, bundle.layout(), &bundle_id, &cancel, io)
            .await;
        spec_cleanup.release();

        match result? {
            0 => Ok(()),
            code if cancel.is_cancelled() => Err(ImgError::Cancelled { code }),
            code => {
                self.log_runtime_failure(&bundle_id, code);
                Err(ImgError::ExecutionFailed { code })
            }
        }
    }
}

fn piped_if(piped: bool) -> Stdio {
    if piped { Stdio::piped() } else { Stdio::null() }
}

fn pump<R, W>(mut reader: R, mut writer: W) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
            tracing::debug!(error = %e, "output stream closed early");
        }
        let _ = writer.flush().await;
    })
}

/// The single directory a direct-mode root is made of.
fn direct_source(mounts: &[Mount]) -> ImgResult<PathBuf> {
    match mounts {
        [m] if m.typ == "bind" => Ok(m.source.clone()),
        _ => Err(ImgError::Unsupported(format!(
            "direct rootfs needs exactly one bind mount, got {}",
            mounts.len()
        ))),
    }
}
