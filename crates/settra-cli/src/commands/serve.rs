//! The `settra serve` command: environment configuration and the accept loop.

use settra_http::{ServerConfig, serve};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub fn run(bind: SocketAddr) -> Result<(), String> {
    let doc_only = env_truthy("DOC_ONLY");
    let db_path = std::env::var_os("SETTRA_DB_PATH").map(PathBuf::from);
    if db_path.is_none() && !doc_only {
        return Err("SETTRA_DB_PATH is required (set DOC_ONLY=true to serve without one)".to_string());
    }
    let startup_context_features = std::env::var("SETTRA_STARTUP_CONTEXT_FEATURES")
        .ok()
        .map(|raw| parse_startup_features(&raw));
    let request_timeout = match std::env::var("SETTRA_REQUEST_TIMEOUT_SECS") {
        Ok(raw) => Duration::from_secs(
            raw.parse()
                .map_err(|_| format!("SETTRA_REQUEST_TIMEOUT_SECS must be a number, got {raw:?}"))?,
        ),
        Err(_) => Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
    };

    let config = ServerConfig {
        bind,
        db_path,
        startup_context_features,
        doc_only,
        request_timeout,
    };
    serve(config).map_err(|err| err.to_string())
}

/// Semicolon-delimited ordered feature list, empty entries dropped.
fn parse_startup_features(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|value| {
            let value = value.trim().to_ascii_lowercase();
            matches!(value.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_features_split_on_semicolons() {
        assert_eq!(
            parse_startup_features("account;user;theme"),
            vec!["account", "user", "theme"]
        );
        assert_eq!(parse_startup_features("account; user ;"), vec!["account", "user"]);
        assert!(parse_startup_features("").is_empty());
    }
}
