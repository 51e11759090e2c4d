use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tokio_util::sync::CancellationToken;

use img::{ExecMount, Meta, ProcessIo, SnapshotRef, StepRequest};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Committed snapshot to start from (empty root when omitted)
    #[arg(short, long, default_value = "")]
    pub parent: String,

    /// Name for the resulting snapshot
    #[arg(short, long, default_value = "")]
    pub name: String,

    /// User to run as, `user[:group]`
    #[arg(short, long, default_value = "")]
    pub user: String,

    /// Working directory inside the root
    #[arg(short = 'w', long, default_value = "")]
    pub workdir: String,

    /// Environment variables, `KEY=VALUE`
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Mount a committed snapshot read-only, `TARGET=SNAPSHOT`
    #[arg(short, long = "mount")]
    pub mounts: Vec<String>,

    /// Command and arguments
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub async fn execute(args: RunArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let worker = global.create_worker()?;

    let mut mounts = Vec::with_capacity(args.mounts.len());
    for raw in &args.mounts {
        let (target, snapshot) = parse_mount(raw)?;
        let source = SnapshotRef::immutable(worker.snapshotter().clone(), snapshot);
        mounts.push(ExecMount::new(target, Arc::new(source), true));
    }

    let req = StepRequest {
        meta: Meta {
            args: args.args,
            env: args.env,
            cwd: args.workdir,
            user: args.user,
        },
        parent: args.parent,
        mounts,
        io: ProcessIo::forward_output(),
        name: args.name,
    };

    let name = worker
        .run_step(CancellationToken::new(), req)
        .await
        .context("build step failed")?;
    println!("{}", name);
    Ok(())
}

fn parse_mount(raw: &str) -> anyhow::Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((target, snapshot)) if target.starts_with('/') && !snapshot.is_empty() => {
            Ok((target, snapshot))
        }
        _ => anyhow::bail!("invalid mount {:?}, expected /TARGET=SNAPSHOT", raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount() {
        assert_eq!(parse_mount("/cache=deps").unwrap(), ("/cache", "deps"));
        assert!(parse_mount("cache=deps").is_err());
        assert!(parse_mount("/cache=").is_err());
        assert!(parse_mount("/cache").is_err());
    }
}
