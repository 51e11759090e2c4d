mod cli;
mod commands;
mod format;

use clap::Parser;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    if cli.command.needs_namespace() && !cli.global.no_unshare {
        match img::identity::reexec::maybe_reexec() {
            Ok(Some(status)) => std::process::exit(img::util::process::exit_code(status)),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    let log_guard = img::util::init_logging(cli.global.debug);
    if let Err(e) = img::mount::shutdown::install_shutdown_hook() {
        tracing::warn!(error = %e, "Failed to install signal handler");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(run(cli));
    drop(runtime);
    drop(log_guard);
    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let global = cli.global;
    match cli.command {
        Commands::Run(args) => commands::run::execute(args, &global).await,
        Commands::Du(args) => commands::du::execute(args, &global).await,
        Commands::Prune => commands::prune::execute(&global).await,
        Commands::Rm(args) => commands::rm::execute(args, &global).await,
        Commands::Diff(args) => commands::diff::execute(args, &global).await,
        Commands::Apply(args) => commands::apply::execute(args, &global).await,
        Commands::Ls(args) => commands::ls::execute(args, &global).await,
        Commands::Reconcile => commands::reconcile::execute(&global).await,
        Commands::Version => commands::version::execute(),
    }
}
