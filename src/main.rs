// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod bridge;
mod cli;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Completions { shell }) => {
            cli::print_completions(shell);
            Ok(())
        }
        Some(Commands::ShowConfig) => {
            let config = relay_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Some(Commands::Start) | None => {
            let config = relay_config::load(cli.config.as_deref())?;
            bridge::run(config).await
        }
    }
}

/// RUST_LOG wins; otherwise `--verbose` lifts the bridge crates to debug.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "relay=debug,relay_core=debug,relay_rpc=debug,relay_chat=debug,\
         relay_session=debug,relay_process=debug"
    } else {
        "relay=info,relay_core=info,relay_rpc=info,relay_chat=info,\
         relay_session=info,relay_process=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
