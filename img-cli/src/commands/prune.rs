use crate::format::human_size;

pub async fn execute(global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let worker = global.create_worker()?;
    let removed = worker.prune().await?;

    let mut total = 0i64;
    for record in &removed {
        total += record.size.max(0);
        println!("{}", record.id);
    }
    println!("Total: {}", human_size(total));
    Ok(())
}
