use anyhow::Result;
use clap::Parser;
use p2pcommons_sdk::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries command output
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    tracing::debug!(base_dir = %cli.base_dir.display(), "p2pcommons starting");
    cli.run().await
}
