//! CLI command definitions and dispatch.

mod copy;

use clap::{Parser, Subcommand};

/// imgrelay - relocate OCI images and bundles between registries and tar
/// archives.
#[derive(Parser)]
#[command(name = "imgrelay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Copy an image or bundle closure to another registry or a tar archive
    Copy(copy::CopyArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Copy(args) => copy::execute(args).await,
    }
}
