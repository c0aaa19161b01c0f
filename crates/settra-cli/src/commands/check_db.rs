//! The `settra check-db` command: offline snapshot invariant audit.

use serde_json::json;
use settra_store::load_snapshot;
use std::path::PathBuf;

pub fn run(path: Option<PathBuf>, json_output: bool) -> Result<(), String> {
    let Some(path) = path.or_else(|| std::env::var_os("SETTRA_DB_PATH").map(PathBuf::from)) else {
        return Err("no snapshot path given (pass --path or set SETTRA_DB_PATH)".to_string());
    };

    match load_snapshot(&path) {
        Ok(store) => {
            if json_output {
                let report = json!({
                    "result": "accepted",
                    "path": path.display().to_string(),
                    "context_features": store.context_features(),
                    "setting_count": store.settings().count(),
                    "rule_count": store.rules().count(),
                    "stamp": store.stamp(),
                });
                println!("{report}");
            } else {
                println!(
                    "{}: ok ({} context features, {} settings, {} rules)",
                    path.display(),
                    store.context_features().len(),
                    store.settings().count(),
                    store.rules().count(),
                );
            }
            Ok(())
        }
        Err(err) => {
            if json_output {
                let report = json!({
                    "result": "rejected",
                    "path": path.display().to_string(),
                    "error": err.to_string(),
                });
                println!("{report}");
            }
            Err(format!("{}: {err}", path.display()))
        }
    }
}
