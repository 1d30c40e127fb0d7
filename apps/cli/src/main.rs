//! feedwatch CLI: security news pipeline with a cost-approval checkpoint.
//!
//! Fetches RSS/Atom feeds, scrapes article bodies, summarizes them with an
//! LLM once the estimated spend is approved, and embeds the summaries.

mod commands;
mod console;

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
