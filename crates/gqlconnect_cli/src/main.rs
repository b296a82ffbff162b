//! Main entry point for the gqlconnect CLI.

use clap::Parser;
use gqlconnect_cli::Cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug || cli.verbose {
        "gqlconnect=debug"
    } else if cli.quiet {
        "gqlconnect=warn"
    } else {
        "gqlconnect=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match gqlconnect_cli::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            gqlconnect_cli::print_error(&e);
            std::process::exit(1);
        }
    }
}
