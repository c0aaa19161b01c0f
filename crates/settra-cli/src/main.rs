//! Settra CLI: the `settra` command.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SETTRA_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve { bind } => commands::serve::run(bind),
        Commands::CheckDb { path, json } => commands::check_db::run(path, json),
    };

    if let Err(message) = result {
        tracing::error!(error = %message, "startup failed");
        eprintln!("error: {message}");
        std::process::exit(1);
    }
}
