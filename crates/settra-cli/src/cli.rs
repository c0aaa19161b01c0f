use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "settra",
    about = "Settra: centralized context-dependent dynamic settings",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service
    ///
    /// Configured through the environment: SETTRA_DB_PATH (required),
    /// SETTRA_STARTUP_CONTEXT_FEATURES (optional semicolon-delimited order),
    /// DOC_ONLY (serve only docs and health), SETTRA_LOG (filter).
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8888")]
        bind: SocketAddr,
    },

    /// Check a state snapshot's structural invariants offline
    CheckDb {
        /// Snapshot path (defaults to SETTRA_DB_PATH)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
