//! Thin CLI harness over the backup/restore orchestration engine
//! (`mbs-core`). The HTTP admin API, persistent task store, cron-style
//! scheduler, and cloud/Mongo drivers are external collaborators out of
//! scope for this engine (spec §1); this binary demonstrates the engine's
//! phase sequences end to end against the crate's own in-memory fakes
//! rather than standing up any of those collaborators itself.

mod subcommands;

use clap::Command;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let matches = get_command().get_matches();
    let (cmd, args) = matches
        .subcommand()
        .ok_or_else(|| anyhow::anyhow!("no subcommand given; run with --help for usage"))?;

    exec_subcommand(cmd, args).await
}

fn get_command() -> Command {
    Command::new("mbsctl")
        .about("Drive the MongoDB backup/restore orchestration engine")
        .args_conflicts_with_subcommands(true)
        .subcommand_required(true)
        .subcommands(subcommands::get_subcommands())
        .help_expected(true)
}

async fn exec_subcommand(cmd: &str, args: &clap::ArgMatches) -> Result<(), anyhow::Error> {
    match cmd {
        "backup" => subcommands::backup::exec(args).await,
        "restore" => subcommands::restore::exec(args).await,
        unknown => Err(anyhow::anyhow!("invalid subcommand: {unknown}")),
    }
}
