// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

/// Slack bridge for an agentic coding subprocess.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
pub struct Cli {
    /// Verbose logging to stderr (overridden by RUST_LOG).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Path to the config file (merged over the default search paths).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the bridge: connect to Slack, spawn the subprocess, serve turns.
    Start,

    /// Print the merged configuration and exit.
    ShowConfig,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "relay", &mut std::io::stdout());
}
