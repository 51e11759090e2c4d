use clap::Args;

use img::Kind;

use crate::format::{age, table};

#[derive(Args, Debug)]
pub struct LsArgs {
    /// Include active and view snapshots
    #[arg(short, long)]
    pub all: bool,

    /// Only print names
    #[arg(short, long)]
    pub quiet: bool,

    /// Print the description chain of one snapshot instead
    #[arg(long, value_name = "NAME")]
    pub history: Option<String>,
}

pub async fn execute(args: LsArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let worker = global.create_worker()?;

    if let Some(name) = &args.history {
        println!("{}", worker.describe(name).await?);
        return Ok(());
    }

    let mut infos = worker.list().await?;
    infos.retain(|info| args.all || info.kind == Kind::Committed);
    infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if args.quiet {
        for info in &infos {
            println!("{}", info.name);
        }
        return Ok(());
    }

    let mut out = table(&["NAME", "PARENT", "KIND", "CREATED"]);
    for info in &infos {
        out.add_row(vec![
            info.name.clone(),
            info.parent.clone().unwrap_or_default(),
            info.kind.to_string(),
            age(info.created_at),
        ]);
    }
    println!("{}", out);
    Ok(())
}
