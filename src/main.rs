mod cli;
mod execute;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use crate::cli::CLI;

fn main() -> Result<()> {
    let cli = CLI::parse();
    init_logging(cli.verbose)?;
    execute::execute(cli)
}

/// Logs go to stderr so that `resolve` output on stdout stays machine readable.
fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kitsmith={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")
}
