pub async fn execute(global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let worker = global.create_worker()?;
    let report = worker.reconcile().await?;

    for path in &report.restored {
        println!("restored {}", path.display());
    }
    for path in &report.removed {
        println!("removed {}", path.display());
    }
    Ok(())
}
