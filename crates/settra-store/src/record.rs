//! Setting and rule records: the rows of the persisted state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use settra_types::{SettingVersion, ValueType};
use std::collections::{BTreeMap, BTreeSet};

/// A declared setting.
///
/// `name` together with every alias is globally unique across the store.
/// `default_value` is required for new declarations but kept optional here so
/// snapshots written before that requirement still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    pub configurable_features: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub aliases: BTreeSet<String>,
    #[serde(default = "SettingVersion::default")]
    pub version: SettingVersion,
    #[serde(default = "default_timestamp")]
    pub last_touch: DateTime<Utc>,
}

fn default_timestamp() -> DateTime<Utc> {
    Utc::now()
}

impl SettingRecord {
    /// Construct a record at the initial version with empty metadata and
    /// no aliases.
    pub fn new(
        name: impl Into<String>,
        value_type: ValueType,
        default_value: Option<Value>,
        configurable_features: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            name: name.into(),
            value_type,
            default_value,
            configurable_features: configurable_features.into_iter().collect(),
            metadata: BTreeMap::new(),
            aliases: BTreeSet::new(),
            version: SettingVersion::INITIAL,
            last_touch: Utc::now(),
        }
    }

    /// Bump the touch timestamp without changing semantic content.
    pub fn touch(&mut self) {
        self.last_touch = Utc::now();
    }
}

/// An exact-match rule binding a value to a setting.
///
/// `feature_values` is non-empty; every key is one of the setting's
/// configurable features. The pair (setting, feature_values) is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: u64,
    pub setting: String,
    pub feature_values: BTreeMap<String, String>,
    pub value: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}
