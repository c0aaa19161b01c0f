//! Shared application state: the guarded store, its snapshot path, and the
//! health sentinel.

use settra_service::HealthMonitor;
use settra_store::{SnapshotError, StateStore, StoreError, load_snapshot, save_snapshot};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

/// Startup configuration for the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// The snapshot file backing the store. Unused in doc-only mode.
    pub db_path: Option<PathBuf>,
    /// Expected feature order to reconcile at startup.
    pub startup_context_features: Option<Vec<String>>,
    /// Serve only the docs route and `/api/health`, with no store.
    pub doc_only: bool,
    /// Per-request socket deadline bounding worst-case blocking.
    pub request_timeout: std::time::Duration,
}

/// The store with its persistence path.
pub struct DbState {
    store: RwLock<StateStore>,
    path: PathBuf,
}

impl DbState {
    pub fn read(&self) -> RwLockReadGuard<'_, StateStore> {
        match self.store.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, StateStore> {
        match self.store.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Persist the committed state. Called while the write lock is held, so
    /// snapshots on disk always reflect a single consistent mutation.
    pub fn persist(&self, store: &StateStore) -> Result<(), SnapshotError> {
        save_snapshot(&self.path, store)
    }

    fn probe(&self) -> bool {
        std::fs::metadata(&self.path).is_ok() && self.store.read().is_ok()
    }
}

/// Errors that abort startup.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("a database path is required outside doc-only mode")]
    MissingDbPath,

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a request handler can reach.
pub struct AppState {
    db: Option<Arc<DbState>>,
    health: Option<HealthMonitor>,
    version: &'static str,
}

impl AppState {
    /// Open (or initialize) the store and start the sentinel.
    pub fn open(config: &ServerConfig) -> Result<Self, OpenError> {
        if config.doc_only {
            info!("doc-only mode: no database connection made");
            return Ok(Self {
                db: None,
                health: None,
                version: env!("CARGO_PKG_VERSION"),
            });
        }
        let path = config.db_path.clone().ok_or(OpenError::MissingDbPath)?;
        let mut store = if path.exists() {
            load_snapshot(&path)?
        } else {
            info!(path = %path.display(), "initializing empty state snapshot");
            StateStore::new()
        };
        if let Some(expected) = &config.startup_context_features {
            store.ensure_context_features(expected)?;
        }
        save_snapshot(&path, &store)?;
        info!(
            path = %path.display(),
            context_features = ?store.context_features(),
            "opened state snapshot"
        );

        let db = Arc::new(DbState {
            store: RwLock::new(store),
            path,
        });
        let probe_db = Arc::clone(&db);
        let health = HealthMonitor::start(move || probe_db.probe(), HealthMonitor::DEFAULT_INTERVAL);
        Ok(Self {
            db: Some(db),
            health: Some(health),
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    /// Build a state around an existing store, for tests.
    pub fn with_store(store: StateStore, path: PathBuf) -> Self {
        Self {
            db: Some(Arc::new(DbState {
                store: RwLock::new(store),
                path,
            })),
            health: None,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn db(&self) -> Option<&DbState> {
        self.db.as_deref()
    }

    pub fn version(&self) -> &'static str {
        self.version
    }

    /// Whether the latest health sample is ok. Doc-only states, which have
    /// nothing to probe, always report healthy.
    pub fn healthy(&self) -> bool {
        match &self.health {
            Some(monitor) => monitor.sample().ok,
            None => true,
        }
    }
}
