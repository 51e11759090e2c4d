use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Committed snapshot to export
    pub name: String,

    /// Output file for the gzip-compressed layer
    #[arg(short, long)]
    pub output: PathBuf,
}

pub async fn execute(args: DiffArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let worker = global.create_worker()?;
    let file = File::create(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;

    let layer = match worker.export_diff(&args.name, BufWriter::new(file)).await {
        Ok(layer) => layer,
        Err(e) => {
            let _ = std::fs::remove_file(&args.output);
            return Err(e.into());
        }
    };

    println!("digest:  {}", layer.digest);
    println!("diff_id: {}", layer.diff_id);
    println!("size:    {}", layer.size);
    Ok(())
}
