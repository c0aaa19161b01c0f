//! Snapshot persistence: the whole state as one atomically-written JSON file.
//!
//! The snapshot is the service's database. Writes go through a temp file,
//! fsync, rename, and parent-directory sync so a crash never leaves a
//! half-written state behind.

use crate::record::{RuleRecord, SettingRecord};
use crate::state::StateStore;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SNAPSHOT_SCHEMA: u32 = 1;
pub const SNAPSHOT_KIND: &str = "settra.state.v1";

/// The serialized image of a [`StateStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema: u32,
    pub kind: String,
    pub context_features: Vec<String>,
    pub settings: Vec<SettingRecord>,
    pub rules: Vec<RuleRecord>,
    pub next_rule_id: u64,
    pub stamp: u64,
}

impl Snapshot {
    /// Capture the current state.
    pub fn capture(store: &StateStore) -> Self {
        let (features, settings, rules, next_rule_id, stamp) = store.parts();
        Self {
            schema: SNAPSHOT_SCHEMA,
            kind: SNAPSHOT_KIND.to_string(),
            context_features: features.to_vec(),
            settings: settings.into_iter().cloned().collect(),
            rules: rules.into_iter().cloned().collect(),
            next_rule_id,
            stamp,
        }
    }

    /// Rebuild a store, verifying schema, kind, and structural invariants.
    pub fn restore(self) -> Result<StateStore, SnapshotError> {
        if self.schema != SNAPSHOT_SCHEMA {
            return Err(SnapshotError::Schema {
                expected: SNAPSHOT_SCHEMA,
                got: self.schema,
            });
        }
        if self.kind != SNAPSHOT_KIND {
            return Err(SnapshotError::Corrupt(format!(
                "kind must equal {SNAPSHOT_KIND:?}, got {:?}",
                self.kind
            )));
        }
        let store = StateStore::from_parts(
            self.context_features,
            self.settings,
            self.rules,
            self.next_rule_id,
            self.stamp,
        )
        .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
        let violations = store.verify_invariants();
        if !violations.is_empty() {
            return Err(SnapshotError::Corrupt(violations.join("; ")));
        }
        Ok(store)
    }
}

/// Load a store from a snapshot file.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<StateStore, SnapshotError> {
    let path = path.as_ref();
    let bytes =
        fs::read(path).map_err(|e| SnapshotError::Io(format!("{}: {e}", path.display())))?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes)
        .map_err(|e| SnapshotError::Parse(format!("{}: {e}", path.display())))?;
    snapshot.restore()
}

/// Persist a store to a snapshot file, atomically.
pub fn save_snapshot(path: impl AsRef<Path>, store: &StateStore) -> Result<(), SnapshotError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|e| SnapshotError::Io(format!("{}: {e}", parent.display())))?;
    }

    let snapshot = Snapshot::capture(store);
    let tmp_path = tmp_write_path(path);
    let write_result = (|| -> Result<(), SnapshotError> {
        let file = File::create(&tmp_path)
            .map_err(|e| SnapshotError::Io(format!("{}: {e}", tmp_path.display())))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &snapshot)
            .map_err(|e| SnapshotError::Serialize(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SnapshotError::Io(format!("{}: {e}", tmp_path.display())))?;
        let file = writer
            .into_inner()
            .map_err(|e| SnapshotError::Io(format!("{}: {e}", tmp_path.display())))?;
        file.sync_all()
            .map_err(|e| SnapshotError::Io(format!("{}: {e}", tmp_path.display())))?;
        Ok(())
    })();

    if let Err(error) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        SnapshotError::Io(format!(
            "{} -> {}: {e}",
            tmp_path.display(),
            path.display()
        ))
    })?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        let dir = File::open(parent)
            .map_err(|e| SnapshotError::Io(format!("{}: {e}", parent.display())))?;
        dir.sync_all()
            .map_err(|e| SnapshotError::Io(format!("{}: {e}", parent.display())))?;
    }

    Ok(())
}

fn tmp_write_path(path: &Path) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(format!(".tmp.{}.{}", std::process::id(), unique));
    PathBuf::from(tmp)
}

/// Errors from snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("corrupted snapshot: {0}")]
    Corrupt(String),

    #[error("snapshot schema must be {expected}, got {got}")]
    Schema { expected: u32, got: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use settra_types::ValueType;
    use std::collections::BTreeMap;

    fn temp_path(prefix: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "settra-snapshot-{prefix}-{}-{unique}.json",
            std::process::id()
        ))
    }

    fn sample_store() -> StateStore {
        let mut store = StateStore::new();
        store.add_context_feature("account").expect("feature should add");
        store.add_context_feature("user").expect("feature should add");
        store
            .insert_setting(crate::record::SettingRecord::new(
                "cache_size",
                ValueType::parse("int").expect("type should parse"),
                Some(json!(5)),
                ["account".to_string(), "user".to_string()],
            ))
            .expect("setting should insert");
        store.rename_setting("cache_size", "cache_slots").expect("rename should succeed");
        store
            .add_rule(
                "cache_slots",
                [("user".to_string(), "guest".to_string())].into_iter().collect(),
                json!(10),
                BTreeMap::new(),
            )
            .expect("rule should add");
        store
    }

    #[test]
    fn snapshot_round_trips_the_whole_state() {
        let path = temp_path("round-trip");
        let store = sample_store();
        save_snapshot(&path, &store).expect("snapshot should save");

        let restored = load_snapshot(&path).expect("snapshot should load");
        assert_eq!(restored.context_features(), store.context_features());
        assert_eq!(restored.stamp(), store.stamp());
        let record = restored.setting("cache_size").expect("alias should survive");
        assert_eq!(record.name, "cache_slots");
        assert_eq!(restored.rules().count(), 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn save_replaces_the_file_atomically() {
        let path = temp_path("atomic");
        let first = sample_store();
        save_snapshot(&path, &first).expect("first save should succeed");

        let mut second = sample_store();
        second.delete_setting("cache_slots").expect("setting should delete");
        save_snapshot(&path, &second).expect("second save should succeed");

        let restored = load_snapshot(&path).expect("snapshot should load");
        assert!(restored.setting("cache_slots").is_none());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn load_rejects_wrong_schema() {
        let path = temp_path("schema");
        let mut snapshot = Snapshot::capture(&sample_store());
        snapshot.schema = 99;
        fs::write(&path, serde_json::to_vec(&snapshot).expect("snapshot should serialize"))
            .expect("fixture should write");

        let err = load_snapshot(&path).expect_err("wrong schema must fail");
        assert!(matches!(err, SnapshotError::Schema { got: 99, .. }));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn load_rejects_invariant_violations() {
        let path = temp_path("invariants");
        let mut snapshot = Snapshot::capture(&sample_store());
        // point a rule at a setting that does not exist
        snapshot.rules[0].setting = "missing".to_string();
        fs::write(&path, serde_json::to_vec(&snapshot).expect("snapshot should serialize"))
            .expect("fixture should write");

        let err = load_snapshot(&path).expect_err("broken invariants must fail");
        assert!(matches!(err, SnapshotError::Corrupt(_)));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn load_reports_missing_files_as_io_errors() {
        let err = load_snapshot(temp_path("missing")).expect_err("missing file must fail");
        assert!(matches!(err, SnapshotError::Io(_)));
    }
}
