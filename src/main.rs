mod auth;
mod cli;
mod config;
mod error;
mod providers;
mod query;
mod rate_limit;
mod records;
mod server;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    info!("Starting Pipelens - Azure DevOps build history");
    cli.execute().await?;

    Ok(())
}
