use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Committed snapshot to apply on top of (empty root when omitted)
    #[arg(short, long, default_value = "")]
    pub parent: String,

    /// Name for the resulting snapshot
    #[arg(short, long, default_value = "")]
    pub name: String,

    /// Layer tarball, plain or gzip-compressed
    pub layer: PathBuf,
}

pub async fn execute(args: ApplyArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let worker = global.create_worker()?;
    let file = File::open(&args.layer)
        .with_context(|| format!("failed to open {}", args.layer.display()))?;

    let applied = worker
        .apply_layer(&args.parent, &args.name, BufReader::new(file))
        .await?;
    tracing::debug!(entries = applied.entries, "Unpacked layer");
    println!("{}", applied.name);
    Ok(())
}
