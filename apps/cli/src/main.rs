//! Flywheel CLI — recursive web-content collection.
//!
//! Seeds a query-generation/scrape/filter/crawl pipeline with documents and
//! runs it to quiescence, feeding crawl summaries back in as new seeds.

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
