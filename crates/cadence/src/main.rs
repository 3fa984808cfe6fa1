use anyhow::Result;
use cadence::cli;
use clap::{Parser, Subcommand};

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Check(args) => args.run(),
        Command::Simulate(args) => args.run(),
    }
}

#[derive(Parser)]
#[command(name = "cadence", about = "Step-timing tooling for Cadence")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a machine configuration file.
    Check(cli::check::CheckArgs),
    /// Plan a move and walk its step timeline.
    Simulate(cli::simulate::SimulateArgs),
}
