use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = qbank_sync_cli::Cli::parse();
    qbank_sync_cli::run_cli(cli)
}
