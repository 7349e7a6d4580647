mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with chat replies on stdout.
    let default_filter = if cli.verbose {
        "info,chatlink_core=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Chat(args) => commands::chat::run(cli.config.as_deref(), args).await,
        Commands::Config { command } => commands::config::run(cli.config.as_deref(), command),
    };

    if let Err(err) = result {
        error::handle_error(err);
    }
}
