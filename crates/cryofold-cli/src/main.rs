use clap::Parser;
mod cli;
mod commands;
mod logging;

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    logging::setup_logging(cli.verbose, cli.quiet)?;
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "cryofold starting");
    cli.execute()?;
    Ok(())
}
