//! # Settra Store
//!
//! Canonical in-memory representation of the service state:
//! - the ordered context-feature registry
//! - setting records with aliases, metadata, and versions
//! - exact-match rules with their conditions and metadata
//!
//! This is the memory boundary of the service: every mutation is
//! invariant-checked here, and the whole state round-trips through an
//! atomically-written JSON snapshot. Orchestration concerns (declaration
//! outcomes, query shaping, HTTP) live in the crates above.

pub mod record;
pub mod snapshot;
pub mod state;

pub use record::{RuleRecord, SettingRecord};
pub use snapshot::{Snapshot, SnapshotError, load_snapshot, save_snapshot};
pub use state::{MoveAnchor, SettingUpdate, StateStore, StoreError};
