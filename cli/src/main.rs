// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Relay Gateway
//!
//! The `relay-gateway` binary fronts an internal orchestration API for remote
//! clients. Configuration is layered: built-in defaults, then an optional
//! YAML file (`--config`), then `RELAY_*` environment variables and flags.
//! A `.env` file in the working directory is loaded first when present.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

mod args;
mod server;

use args::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = cli.load_config()?;
    info!(core_url = %config.core_url, "Relay configuration loaded");

    server::run(config, &cli.host, cli.port).await
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
