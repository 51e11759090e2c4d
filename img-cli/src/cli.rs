use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use img::executor::RootfsMode;
use img::{DiffStrategy, ImgOptions, Worker};
use img_shared::constants::envs;

use crate::commands;

#[derive(Parser, Debug)]
#[command(name = "img", author, version, about = "Daemon-less, unprivileged container image builder")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// State directory
    #[arg(long, global = true, env = envs::STATE_DIR)]
    pub state: Option<PathBuf>,

    /// Snapshot backend
    #[arg(long, global = true, default_value = "auto")]
    pub backend: String,

    /// OCI runtime binary
    #[arg(long, global = true, env = envs::RUNTIME)]
    pub runtime: Option<String>,

    /// Bind the snapshot onto the bundle rootfs instead of using it in place
    #[arg(long, global = true)]
    pub bind_rootfs: bool,

    /// Bind both sides onto temporary mounts before diffing
    #[arg(long, global = true)]
    pub mount_diff: bool,

    /// Do not re-execute inside a user namespace
    #[arg(long, global = true)]
    pub no_unshare: bool,
}

impl GlobalFlags {
    pub fn options(&self) -> ImgOptions {
        let mut opts = ImgOptions {
            backend: self.backend.clone(),
            ..ImgOptions::default()
        };
        if let Some(state) = &self.state {
            opts.state_dir = state.clone();
        }
        if let Some(runtime) = &self.runtime {
            opts.runtime = runtime.clone();
        }
        if self.bind_rootfs {
            opts.rootfs_mode = Some(RootfsMode::BindMount);
        }
        if self.mount_diff {
            opts.diff_strategy = DiffStrategy::MountAndDiff;
        }
        opts
    }

    pub fn create_worker(&self) -> anyhow::Result<Worker> {
        Ok(Worker::new(self.options())?)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one build step on top of a snapshot and commit the result
    Run(commands::run::RunArgs),

    /// Show disk usage per snapshot
    Du(commands::du::DuArgs),

    /// Remove all reclaimable snapshots
    Prune,

    /// Remove snapshots
    Rm(commands::rm::RmArgs),

    /// Export a snapshot's changes as a layer tarball
    Diff(commands::diff::DiffArgs),

    /// Unpack a layer tarball into a new snapshot
    Apply(commands::apply::ApplyArgs),

    /// List snapshots
    Ls(commands::ls::LsArgs),

    /// Clean up after an interrupted run
    Reconcile,

    /// Show version information
    Version,
}

impl Commands {
    /// Commands that touch snapshots and so must run inside the namespace.
    pub fn needs_namespace(&self) -> bool {
        !matches!(self, Commands::Version)
    }
}
