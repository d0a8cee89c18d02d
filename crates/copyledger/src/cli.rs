// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Command line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use copyledger_core::ReplicaTarget;

/// Copyledger: replication bookkeeping for stored objects.
#[derive(Parser)]
#[command(name = "copyledger")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true, env = "COPYLEDGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show replication counts across the ledger.
    Status(StatusArgs),
    /// Print one record.
    Show(ShowArgs),
    /// Clear a target's copy so it is replicated again.
    Reset(ResetArgs),
    /// Stop replicating an object to every target.
    Unmark(KeyArgs),
    /// Print version information.
    Version,
}

/// Arguments for the status command.
#[derive(Args)]
pub struct StatusArgs {
    /// Output format (text, json).
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for the show command.
#[derive(Args)]
pub struct ShowArgs {
    /// Object key.
    pub key: String,

    /// Output format (text, json).
    #[arg(short, long, default_value = "json")]
    pub format: OutputFormat,
}

/// Arguments naming a single object.
#[derive(Args)]
pub struct KeyArgs {
    /// Object key.
    pub key: String,
}

/// Arguments for the reset command.
#[derive(Args)]
pub struct ResetArgs {
    /// Object key.
    pub key: String,

    /// Target to reset (b2, wasabi, scw).
    #[arg(short, long)]
    pub target: ReplicaTarget,
}

/// Output format for CLI commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}
