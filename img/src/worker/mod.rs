//! Worker facade.
//!
//! Wires the snapshotter and the executor together behind the operations the
//! CLI exposes: run a step, apply or export a layer, inspect and reclaim
//! disk usage.

mod lock;
mod options;
mod usage;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use img_shared::constants::{backends, runtime};
use img_shared::{ImgError, ImgResult, StateLayout};

use crate::diff::{self, LayerDescriptor};
use crate::executor::{ExecMount, Executor, ExecutorOptions, Meta, ProcessIo, RuncExecutor};
use crate::metadata::{Kind, SnapshotInfo};
use crate::mount::{DiffStrategy, Mount, with_temp_mount};
use crate::snapshot::{ReconcileReport, SnapshotRef, Snapshotter};

pub use lock::StateLock;
pub use options::{AUTO_BACKEND, ImgOptions};
pub use usage::{DESCRIPTION_LABEL, UsageFilter, UsageRecord};

/// One build step.
#[derive(Debug, Default)]
pub struct StepRequest {
    pub meta: Meta,
    /// Committed snapshot to start from. Empty starts from scratch.
    pub parent: String,
    pub mounts: Vec<ExecMount>,
    pub io: ProcessIo,
    /// Name for the resulting snapshot. Generated when empty.
    pub name: String,
}

/// Result of unpacking a layer into a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedLayer {
    pub name: String,
    pub entries: u64,
}

pub struct Worker {
    opts: ImgOptions,
    layout: StateLayout,
    snapshotter: Arc<Snapshotter>,
    executor: Arc<dyn Executor>,
    _lock: StateLock,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("opts", &self.opts)
            .field("root", &self.layout.root())
            .finish()
    }
}

impl Worker {
    /// Open the state directory with the runtime-binary executor.
    pub fn new(opts: ImgOptions) -> ImgResult<Self> {
        Self::open(opts, None)
    }

    /// Open the state directory with a caller-supplied executor.
    pub fn with_executor(opts: ImgOptions, executor: Arc<dyn Executor>) -> ImgResult<Self> {
        Self::open(opts, Some(executor))
    }

    fn open(opts: ImgOptions, executor: Option<Arc<dyn Executor>>) -> ImgResult<Self> {
        let backend = opts.backend_name().to_string();
        let layout = StateLayout::new(&opts.state_dir, runtime::EXECUTOR_NAME, &backend);
        let lock = StateLock::acquire(&layout.lock_file())?;

        let snapshotter = open_snapshotter(&backend, &layout, opts.diff_strategy)
            .map_err(|e| e.context(format!("creating {} snapshotter failed", backend)))?;

        let executor: Arc<dyn Executor> = match executor {
            Some(executor) => executor,
            None => Arc::new(RuncExecutor::new(ExecutorOptions {
                root: layout.executor_dir(),
                runtime: opts.runtime.clone(),
                rootless: opts.rootless,
                rootfs_mode: opts.effective_rootfs_mode(),
                id_mapping: None,
            })?),
        };

        tracing::info!(
            state_dir = %opts.state_dir.display(),
            backend = %backend,
            rootless = opts.rootless,
            "Opened worker"
        );

        Ok(Self {
            opts,
            layout,
            snapshotter: Arc::new(snapshotter),
            executor,
            _lock: lock,
        })
    }

    pub fn options(&self) -> &ImgOptions {
        &self.opts
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn snapshotter(&self) -> &Arc<Snapshotter> {
        &self.snapshotter
    }

    /// Run one step on top of `req.parent` and commit the result.
    ///
    /// The working snapshot is removed again when the step fails, so a
    /// failed step leaves nothing behind. Returns the committed name.
    pub async fn run_step(&self, cancel: CancellationToken, req: StepRequest) -> ImgResult<String> {
        let key = format!("step-{}", uuid::Uuid::new_v4().simple());
        let name = if req.name.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            req.name
        };

        let sn = self.snapshotter.clone();
        let (k, parent) = (key.clone(), req.parent.clone());
        blocking(move || sn.prepare(&k, &parent).map(|_| ())).await?;

        let root = SnapshotRef::mutable(self.snapshotter.clone(), key.clone());
        let description = req.meta.args.join(" ");
        let result = self
            .executor
            .exec(cancel, req.meta, &root, &req.mounts, req.io)
            .await;

        let sn = self.snapshotter.clone();
        if let Err(e) = result {
            let k = key.clone();
            if let Err(re) = blocking(move || sn.remove(&k)).await {
                tracing::warn!(key = %key, error = %re, "Failed to remove snapshot of failed step");
            }
            return Err(e);
        }

        let n = name.clone();
        blocking(move || {
            commit_or_discard(&sn, &n, &key)?;
            set_description(&sn, &n, &format!("exec {}", description))
        })
        .await?;
        tracing::info!(name = %name, parent = %req.parent, "Committed step");
        Ok(name)
    }

    /// Unpack a layer tarball on top of `parent` into a new committed
    /// snapshot named `name` (generated when empty).
    pub async fn apply_layer<R>(&self, parent: &str, name: &str, reader: R) -> ImgResult<AppliedLayer>
    where
        R: Read + Send + 'static,
    {
        let sn = self.snapshotter.clone();
        let parent = parent.to_string();
        let name = if name.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            name.to_string()
        };

        blocking(move || {
            let key = format!("apply-{}", uuid::Uuid::new_v4().simple());
            let mounts = sn.prepare(&key, &parent)?;
            let unpacked = writable_dir(&mounts).and_then(|dir| diff::apply_layer(reader, &dir));
            let entries = match unpacked {
                Ok(entries) => entries,
                Err(e) => {
                    if let Err(re) = sn.remove(&key) {
                        tracing::warn!(key = %key, error = %re, "Failed to remove snapshot of failed apply");
                    }
                    return Err(e);
                }
            };
            commit_or_discard(&sn, &name, &key)?;
            set_description(&sn, &name, "apply layer")?;
            tracing::info!(name = %name, entries, "Applied layer");
            Ok(AppliedLayer { name, entries })
        })
        .await
    }

    /// Write the changes of committed snapshot `name` against its parent as
    /// a compressed layer.
    pub async fn export_diff<W>(&self, name: &str, writer: W) -> ImgResult<LayerDescriptor>
    where
        W: Write + Send + 'static,
    {
        let sn = self.snapshotter.clone();
        let name = name.to_string();
        blocking(move || {
            let upper = sn.committed_dir(&name)?;
            let info = sn.stat(&name)?;
            let empty;
            let lower = match &info.parent {
                Some(parent) => sn.committed_dir(parent)?,
                None => {
                    empty = tempfile::tempdir().map_err(|e| {
                        ImgError::Storage(format!("failed to create empty lower dir: {}", e))
                    })?;
                    empty.path().to_path_buf()
                }
            };
            export(sn.diff_strategy(), &lower, &upper, writer)
        })
        .await
    }

    /// Usage of every snapshot that passes `filters`.
    pub async fn disk_usage<S: AsRef<str>>(&self, filters: &[S]) -> ImgResult<Vec<UsageRecord>> {
        let filter = UsageFilter::parse(filters)?;
        let sn = self.snapshotter.clone();
        blocking(move || collect_usage(&sn, &filter)).await
    }

    /// Remove reclaimable snapshots until none are left, leaves first.
    pub async fn prune(&self) -> ImgResult<Vec<UsageRecord>> {
        let sn = self.snapshotter.clone();
        blocking(move || {
            let mut removed = Vec::new();
            loop {
                let candidates = collect_usage(&sn, &UsageFilter::reclaimable())?;
                let mut progressed = false;
                for record in candidates {
                    match sn.remove(&record.id) {
                        Ok(()) => {
                            progressed = true;
                            removed.push(record);
                        }
                        Err(ImgError::HasChildren(_) | ImgError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                if !progressed {
                    break;
                }
            }
            tracing::info!(count = removed.len(), "Pruned snapshots");
            Ok(removed)
        })
        .await
    }

    pub async fn remove(&self, name: &str) -> ImgResult<()> {
        let sn = self.snapshotter.clone();
        let name = name.to_string();
        blocking(move || sn.remove(&name)).await
    }

    /// One line per layer, newest first: `name: description`.
    pub async fn describe(&self, name: &str) -> ImgResult<String> {
        let sn = self.snapshotter.clone();
        let name = name.to_string();
        blocking(move || {
            let mut chain = vec![sn.stat(&name)?];
            chain.extend(sn.parent_chain(&name)?);
            Ok(chain
                .iter()
                .map(|info| match info.labels.get(DESCRIPTION_LABEL) {
                    Some(description) => format!("{}: {}", info.name, description),
                    None => info.name.clone(),
                })
                .collect::<Vec<_>>()
                .join("\n"))
        })
        .await
    }

    /// Every snapshot, any kind.
    pub async fn list(&self) -> ImgResult<Vec<SnapshotInfo>> {
        let sn = self.snapshotter.clone();
        blocking(move || Ok(sn.list()?.into_iter().map(|r| r.info).collect())).await
    }

    /// Crash-recovery sweep of the snapshot directory.
    ///
    /// The state lock keeps other processes out; callers must not run other
    /// operations on this worker at the same time.
    pub async fn reconcile(&self) -> ImgResult<ReconcileReport> {
        let sn = self.snapshotter.clone();
        blocking(move || sn.reconcile()).await
    }
}

fn open_snapshotter(
    backend: &str,
    layout: &StateLayout,
    strategy: DiffStrategy,
) -> ImgResult<Snapshotter> {
    if backend != backends::NATIVE {
        return Err(ImgError::Unsupported(format!(
            "snapshot backend {:?}, only {:?} is available",
            backend,
            backends::NATIVE
        )));
    }
    layout.prepare().map_err(|e| {
        ImgError::Storage(format!(
            "failed to create {}: {}",
            layout.root().display(),
            e
        ))
    })?;
    Snapshotter::new(layout.root(), strategy)
}

fn commit_or_discard(sn: &Snapshotter, name: &str, key: &str) -> ImgResult<()> {
    if let Err(e) = sn.commit(name, key) {
        if let Err(re) = sn.remove(key) {
            tracing::warn!(key, error = %re, "Failed to remove uncommitted snapshot");
        }
        return Err(e);
    }
    Ok(())
}

fn set_description(sn: &Snapshotter, name: &str, description: &str) -> ImgResult<()> {
    let mut info = sn.stat(name)?;
    info.labels = BTreeMap::from([(DESCRIPTION_LABEL.to_string(), description.to_string())]);
    let label = format!("labels.{}", DESCRIPTION_LABEL);
    sn.update(&info, &[label.as_str()])?;
    Ok(())
}

fn collect_usage(sn: &Snapshotter, filter: &UsageFilter) -> ImgResult<Vec<UsageRecord>> {
    let records = sn.list()?;
    let parents = usage::parents(&records);
    let mut out = Vec::new();
    for record in &records {
        let in_use = parents.contains(record.info.name.as_str());
        let size = if record.info.kind == Kind::Active {
            sn.usage(&record.info.name)?.size
        } else {
            record.usage.size
        };
        let usage = UsageRecord::from_record(record, in_use, size);
        if filter.matches(&usage) {
            out.push(usage);
        }
    }
    Ok(out)
}

fn writable_dir(mounts: &[Mount]) -> ImgResult<std::path::PathBuf> {
    match mounts {
        [m] if !m.is_readonly() => Ok(m.source.clone()),
        _ => Err(ImgError::Unsupported(
            "applying a layer needs a single writable mount".into(),
        )),
    }
}

fn export<W: Write>(
    strategy: DiffStrategy,
    lower: &Path,
    upper: &Path,
    writer: W,
) -> ImgResult<LayerDescriptor> {
    match strategy {
        DiffStrategy::DirectCompare => {
            let changes = diff::compare(lower, upper)?;
            diff::write_layer(upper, &changes, writer)
        }
        DiffStrategy::MountAndDiff => {
            with_temp_mount(&[Mount::bind(lower, true)], |lower| {
                with_temp_mount(&[Mount::bind(upper, true)], |upper| {
                    let changes = diff::compare(lower, upper)?;
                    diff::write_layer(upper, &changes, writer)
                })
            })
        }
    }
}

async fn blocking<T, F>(f: F) -> ImgResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ImgResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ImgError::Internal(format!("blocking task failed: {}", e)))?
}
