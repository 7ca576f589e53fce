//! catalogsync CLI: storefront catalog ingestion.
//!
//! Discovers product URLs through sitemaps, resolves them in batches through
//! the storefront query API, and writes each product once to a local dataset.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let config = commands::load_app_config(&cli)?;
    commands::init_tracing(&cli, config.debug_log);
    commands::run(cli, config).await
}
