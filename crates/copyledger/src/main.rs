// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Copyledger: admin tool for the replication ledger.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use copyledger_core::config::{Config, LogFormat};
use copyledger_core::SystemClock;
use copyledger_store::Ledger;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;
mod commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("copyledger {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    init_logging(&config)?;

    let ledger = open_ledger(&config).await?;

    match cli.command {
        Commands::Status(args) => commands::handle_status(&ledger, args).await,
        Commands::Show(args) => commands::handle_show(&ledger, args).await,
        Commands::Reset(args) => commands::handle_reset(&ledger, args).await,
        Commands::Unmark(args) => commands::handle_unmark(&ledger, args).await,
        Commands::Version => Ok(()),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    // Command output goes to stdout; keep logs out of it.
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }

    Ok(())
}

async fn open_ledger(config: &Config) -> Result<Ledger> {
    let path = &config.ledger.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.context("Failed to create ledger directory")?;
    }
    debug!(path = %path.display(), "Opening ledger");

    Ledger::open(&config.ledger, Arc::new(SystemClock::new()))
        .with_context(|| format!("Failed to open ledger at {}", path.display()))
}
