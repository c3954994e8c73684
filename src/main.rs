/**
 * main.rs
 */

use anyhow::Result;
use clap::Parser;
use peersocks::cli::{self, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    cli::run(Cli::parse()).await
}
