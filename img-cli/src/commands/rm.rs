use clap::Args;

#[derive(Args, Debug)]
pub struct RmArgs {
    /// Snapshot(s) to remove
    #[arg(required = true, num_args = 1..)]
    pub targets: Vec<String>,
}

pub async fn execute(args: RmArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let worker = global.create_worker()?;

    let mut active_error = false;
    for target in args.targets {
        if let Err(e) = worker.remove(&target).await {
            eprintln!("Error removing snapshot '{}': {}", target, e);
            active_error = true;
        } else {
            println!("{}", target);
        }
    }

    if active_error {
        anyhow::bail!("Some snapshots could not be removed");
    }
    Ok(())
}
