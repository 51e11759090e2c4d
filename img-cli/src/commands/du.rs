use clap::Args;

use crate::format::{human_size, table};

#[derive(Args, Debug)]
pub struct DuArgs {
    /// Filter output, `id=`, `parent=`, `mutable=` or `reclaimable=`
    #[arg(short, long = "filter")]
    pub filters: Vec<String>,

    /// Print records as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: DuArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let worker = global.create_worker()?;
    let records = worker.disk_usage(&args.filters).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    let mut out = table(&["ID", "RECLAIMABLE", "SIZE", "DESCRIPTION"]);
    let mut total = 0i64;
    let mut reclaimable = 0i64;
    for record in &records {
        let size = record.size.max(0);
        total += size;
        if record.reclaimable() {
            reclaimable += size;
        }
        out.add_row(vec![
            record.id.clone(),
            record.reclaimable().to_string(),
            human_size(record.size),
            record.description.clone().unwrap_or_default(),
        ]);
    }
    println!("{}", out);
    println!("Reclaimable:\t{}", human_size(reclaimable));
    println!("Total:\t\t{}", human_size(total));
    Ok(())
}
