use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = pairpref_cli::Cli::parse();
    pairpref_cli::run_cli(cli)
}
