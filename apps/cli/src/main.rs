//! DocDrift CLI — turn community chat into documentation proposals.
//!
//! Drives the incremental batch pipeline over ingested messages and
//! reports on streams, watermarks and pending proposals.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
