//! The canonical state store and its invariant-checked mutations.

use crate::record::{RuleRecord, SettingRecord};
use serde_json::Value;
use settra_types::{SettingVersion, ValueType, is_valid_metadata_key, is_valid_name};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Errors raised by store mutations and lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("context feature not found: {0}")]
    FeatureNotFound(String),

    #[error("context feature already exists: {0}")]
    FeatureExists(String),

    #[error("context feature {feature} is configurable for settings: {settings:?}")]
    FeatureInUse {
        feature: String,
        settings: Vec<String>,
    },

    #[error("unknown context features: {0:?}")]
    UnknownFeatures(Vec<String>),

    #[error("setting not found: {0}")]
    SettingNotFound(String),

    #[error("name {0:?} already exists as a setting name or alias")]
    NameTaken(String),

    #[error("rule not found: {0}")]
    RuleNotFound(u64),

    #[error("a rule for setting {setting} with the same conditions already exists: {rule_id}")]
    RuleExists { setting: String, rule_id: u64 },

    #[error("rule conditions must not be empty")]
    EmptyConditions,

    #[error("setting {setting} is not configurable by context features: {features:?}")]
    NotConfigurable {
        setting: String,
        features: Vec<String>,
    },

    #[error("value {value} does not conform to setting type {value_type}")]
    ValueMismatch { value_type: String, value: String },

    #[error("type {value_type} conflicts with existing values")]
    TypeConflicts {
        value_type: String,
        conflicts: Vec<String>,
    },

    #[error("configurable features cannot be removed, in use by rules: {conflicts:?}")]
    FeaturesInUseByRules { conflicts: Vec<String> },

    #[error("invalid identifier: {0:?}")]
    InvalidName(String),

    #[error("invalid metadata key: {0:?}")]
    InvalidMetadataKey(String),

    #[error("condition value for context feature {feature} must be a non-empty string")]
    InvalidConditionValue { feature: String },

    #[error("context feature registry cannot be reconciled: {0}")]
    Reconcile(String),
}

/// Where to re-insert a context feature on a move.
///
/// The pivot index is computed **after** the moved feature is removed, so
/// `Before(x)` always lands the feature immediately left of `x` and
/// `After(x)` immediately right of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveAnchor {
    Before(String),
    After(String),
}

/// A batched setting update, applied atomically by [`StateStore::update_setting`].
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingUpdate {
    pub rename: Option<String>,
    pub value_type: Option<ValueType>,
    pub default_value: Option<Value>,
    pub metadata: Option<BTreeMap<String, Value>>,
    pub configurable_features: Option<BTreeSet<String>>,
    pub version: Option<SettingVersion>,
}

impl SettingUpdate {
    pub fn is_empty(&self) -> bool {
        self.rename.is_none()
            && self.value_type.is_none()
            && self.default_value.is_none()
            && self.metadata.is_none()
            && self.configurable_features.is_none()
            && self.version.is_none()
    }
}

/// Canonical in-memory state for the whole service.
///
/// Deterministic iteration everywhere: settings sort by name, rules by id,
/// context features by their registry order.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    features: Vec<String>,
    settings: BTreeMap<String, SettingRecord>,
    aliases: BTreeMap<String, String>,
    rules: BTreeMap<u64, RuleRecord>,
    next_rule_id: u64,
    stamp: u64,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            next_rule_id: 1,
            ..Self::default()
        }
    }

    /// Rebuild a store from snapshot parts. The alias index is derived.
    pub(crate) fn from_parts(
        features: Vec<String>,
        settings: Vec<SettingRecord>,
        rules: Vec<RuleRecord>,
        next_rule_id: u64,
        stamp: u64,
    ) -> Result<Self, StoreError> {
        let mut store = Self {
            features,
            settings: BTreeMap::new(),
            aliases: BTreeMap::new(),
            rules: BTreeMap::new(),
            next_rule_id,
            stamp,
        };
        for record in settings {
            for alias in &record.aliases {
                if store.aliases.insert(alias.clone(), record.name.clone()).is_some() {
                    return Err(StoreError::NameTaken(alias.clone()));
                }
            }
            if store.settings.insert(record.name.clone(), record).is_some() {
                return Err(StoreError::Reconcile("duplicate setting name".to_string()));
            }
        }
        for rule in rules {
            store.rules.insert(rule.id, rule);
        }
        Ok(store)
    }

    /// Monotonic mutation counter; the seed of the query ETag.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    fn bump(&mut self) {
        self.stamp += 1;
    }

    // ── Context-feature registry ──

    /// All context features in hierarchical order.
    pub fn context_features(&self) -> &[String] {
        &self.features
    }

    /// The registry index of a feature, if present.
    pub fn context_feature_index(&self, name: &str) -> Option<usize> {
        self.features.iter().position(|f| f == name)
    }

    /// The subset of `candidates` that are not registered features.
    pub fn unknown_context_features<'a, I>(&self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        candidates
            .into_iter()
            .filter(|candidate| self.context_feature_index(candidate).is_none())
            .cloned()
            .collect()
    }

    /// Append a feature to the end of the registry and return its index.
    pub fn add_context_feature(&mut self, name: &str) -> Result<usize, StoreError> {
        if !is_valid_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        if self.context_feature_index(name).is_some() {
            return Err(StoreError::FeatureExists(name.to_string()));
        }
        self.features.push(name.to_string());
        self.bump();
        info!(context_feature = %name, "added context feature");
        Ok(self.features.len() - 1)
    }

    /// Remove a feature. Fails while any setting is configurable by it.
    pub fn delete_context_feature(&mut self, name: &str) -> Result<(), StoreError> {
        let Some(index) = self.context_feature_index(name) else {
            return Err(StoreError::FeatureNotFound(name.to_string()));
        };
        let users: Vec<String> = self
            .settings
            .values()
            .filter(|setting| setting.configurable_features.contains(name))
            .map(|setting| setting.name.clone())
            .collect();
        if !users.is_empty() {
            return Err(StoreError::FeatureInUse {
                feature: name.to_string(),
                settings: users,
            });
        }
        self.features.remove(index);
        self.bump();
        info!(context_feature = %name, "deleted context feature");
        Ok(())
    }

    /// Reposition a feature next to an anchor feature.
    ///
    /// Self-anchored moves are no-ops.
    pub fn move_context_feature(&mut self, name: &str, anchor: MoveAnchor) -> Result<(), StoreError> {
        let target = match &anchor {
            MoveAnchor::Before(target) | MoveAnchor::After(target) => target.clone(),
        };
        let Some(index) = self.context_feature_index(name) else {
            return Err(StoreError::FeatureNotFound(name.to_string()));
        };
        if self.context_feature_index(&target).is_none() {
            return Err(StoreError::FeatureNotFound(target));
        }
        if target == name {
            return Ok(());
        }
        let moved = self.features.remove(index);
        // pivot is resolved after removal, per the remove-then-insert contract
        let pivot = self
            .context_feature_index(&target)
            .expect("anchor feature is present after removing a different feature");
        let destination = match anchor {
            MoveAnchor::Before(_) => pivot,
            MoveAnchor::After(_) => pivot + 1,
        };
        self.features.insert(destination, moved);
        self.bump();
        Ok(())
    }

    /// Reconcile the registry against a startup-expected ordered list.
    ///
    /// The stored order must be a subsequence of `expected`; features in
    /// `expected` but not stored are created at their expected positions.
    /// Anything else (unknown stored features, order disagreement) aborts.
    pub fn ensure_context_features(&mut self, expected: &[String]) -> Result<(), StoreError> {
        let mut seen = BTreeSet::new();
        for name in expected {
            if !is_valid_name(name) {
                return Err(StoreError::InvalidName(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(StoreError::Reconcile(format!(
                    "context feature {name} repeats in the expected list"
                )));
            }
        }
        let mut stored = self.features.iter();
        let mut pending = stored.next();
        for name in expected {
            if pending == Some(name) {
                pending = stored.next();
            }
        }
        if let Some(unmatched) = pending {
            return Err(StoreError::Reconcile(format!(
                "stored context features are not a subsequence of the expected order \
                 (first unmatched: {unmatched})"
            )));
        }
        if self.features != expected {
            let added: Vec<&String> = expected
                .iter()
                .filter(|name| !self.features.contains(name))
                .collect();
            info!(?added, "reconciled context feature registry");
            self.features = expected.to_vec();
            self.bump();
        }
        Ok(())
    }

    // ── Setting catalog ──

    /// Resolve a name or alias to the canonical setting name.
    pub fn resolve_setting_name(&self, name_or_alias: &str) -> Option<&str> {
        if let Some((canonical, _)) = self.settings.get_key_value(name_or_alias) {
            return Some(canonical.as_str());
        }
        self.aliases.get(name_or_alias).map(String::as_str)
    }

    /// Fetch a setting by name or alias.
    pub fn setting(&self, name_or_alias: &str) -> Option<&SettingRecord> {
        let canonical = self.resolve_setting_name(name_or_alias)?;
        self.settings.get(canonical)
    }

    /// All settings, sorted by canonical name.
    pub fn settings(&self) -> impl Iterator<Item = &SettingRecord> {
        self.settings.values()
    }

    fn name_available(&self, name: &str) -> bool {
        !self.settings.contains_key(name) && !self.aliases.contains_key(name)
    }

    /// Insert a brand-new setting record.
    pub fn insert_setting(&mut self, record: SettingRecord) -> Result<(), StoreError> {
        if !is_valid_name(&record.name) {
            return Err(StoreError::InvalidName(record.name.clone()));
        }
        if !self.name_available(&record.name) {
            return Err(StoreError::NameTaken(record.name.clone()));
        }
        for alias in &record.aliases {
            if !is_valid_name(alias) {
                return Err(StoreError::InvalidName(alias.clone()));
            }
            if !self.name_available(alias) {
                return Err(StoreError::NameTaken(alias.clone()));
            }
        }
        let unknown = self.unknown_context_features(record.configurable_features.iter());
        if !unknown.is_empty() {
            return Err(StoreError::UnknownFeatures(unknown));
        }
        validate_metadata_keys(&record.metadata)?;
        if let Some(default) = &record.default_value
            && !record.value_type.validate(default)
        {
            return Err(StoreError::ValueMismatch {
                value_type: record.value_type.to_string(),
                value: default.to_string(),
            });
        }
        for alias in &record.aliases {
            self.aliases.insert(alias.clone(), record.name.clone());
        }
        info!(setting = %record.name, "creating new setting");
        self.settings.insert(record.name.clone(), record);
        self.bump();
        Ok(())
    }

    /// Delete a setting, cascading to its rules and aliases.
    pub fn delete_setting(&mut self, name_or_alias: &str) -> Result<(), StoreError> {
        let Some(canonical) = self.resolve_setting_name(name_or_alias).map(str::to_string) else {
            return Err(StoreError::SettingNotFound(name_or_alias.to_string()));
        };
        let record = self
            .settings
            .remove(&canonical)
            .expect("resolved setting is present");
        for alias in &record.aliases {
            self.aliases.remove(alias);
        }
        self.rules.retain(|_, rule| rule.setting != canonical);
        self.bump();
        info!(setting = %canonical, "deleted setting");
        Ok(())
    }

    /// Rename a setting; the previous canonical name becomes an alias.
    ///
    /// Renaming to an existing alias of the same setting promotes that alias.
    /// Renaming to the current canonical name is a no-op.
    pub fn rename_setting(&mut self, name_or_alias: &str, new_name: &str) -> Result<(), StoreError> {
        if !is_valid_name(new_name) {
            return Err(StoreError::InvalidName(new_name.to_string()));
        }
        let Some(canonical) = self.resolve_setting_name(name_or_alias).map(str::to_string) else {
            return Err(StoreError::SettingNotFound(name_or_alias.to_string()));
        };
        if new_name == canonical {
            return Ok(());
        }
        match self.resolve_setting_name(new_name) {
            Some(owner) if owner != canonical => {
                return Err(StoreError::NameTaken(new_name.to_string()));
            }
            _ => {}
        }
        let mut record = self
            .settings
            .remove(&canonical)
            .expect("resolved setting is present");
        record.aliases.remove(new_name);
        record.aliases.insert(canonical.clone());
        record.name = new_name.to_string();
        record.touch();
        self.aliases.remove(new_name);
        for alias in &record.aliases {
            self.aliases.insert(alias.clone(), new_name.to_string());
        }
        for rule in self.rules.values_mut() {
            if rule.setting == canonical {
                rule.setting = new_name.to_string();
            }
        }
        self.settings.insert(new_name.to_string(), record);
        self.bump();
        info!(setting = %canonical, new_name = %new_name, "renamed setting");
        Ok(())
    }

    /// Apply a batched update, re-checking every affected invariant.
    pub fn update_setting(&mut self, name_or_alias: &str, update: SettingUpdate) -> Result<(), StoreError> {
        let Some(canonical) = self.resolve_setting_name(name_or_alias).map(str::to_string) else {
            return Err(StoreError::SettingNotFound(name_or_alias.to_string()));
        };
        if let Some(metadata) = &update.metadata {
            validate_metadata_keys(metadata)?;
        }
        if let Some(features) = &update.configurable_features {
            let unknown = self.unknown_context_features(features.iter());
            if !unknown.is_empty() {
                return Err(StoreError::UnknownFeatures(unknown));
            }
            let conflicts = self.feature_removal_conflicts(&canonical, features);
            if !conflicts.is_empty() {
                return Err(StoreError::FeaturesInUseByRules { conflicts });
            }
        }
        if let Some(value_type) = &update.value_type {
            let record = self.settings.get(&canonical).expect("resolved setting is present");
            let default = update.default_value.as_ref().or(record.default_value.as_ref());
            let conflicts = self.type_conflicts(&canonical, value_type, default);
            if !conflicts.is_empty() {
                return Err(StoreError::TypeConflicts {
                    value_type: value_type.to_string(),
                    conflicts,
                });
            }
        } else if let Some(default) = &update.default_value {
            let record = self.settings.get(&canonical).expect("resolved setting is present");
            if !record.value_type.validate(default) {
                return Err(StoreError::ValueMismatch {
                    value_type: record.value_type.to_string(),
                    value: default.to_string(),
                });
            }
        }
        if let Some(new_name) = &update.rename {
            self.rename_setting(&canonical, new_name)?;
        }
        let current = update.rename.clone().unwrap_or(canonical);
        let record = self.settings.get_mut(&current).expect("setting is present");
        if let Some(value_type) = update.value_type {
            record.value_type = value_type;
        }
        if let Some(default) = update.default_value {
            record.default_value = Some(default);
        }
        if let Some(metadata) = update.metadata {
            record.metadata = metadata;
        }
        if let Some(features) = update.configurable_features {
            record.configurable_features = features;
        }
        if let Some(version) = update.version {
            record.version = version;
        }
        record.touch();
        self.bump();
        Ok(())
    }

    /// Conflicts with existing values that block a change to `value_type`.
    pub fn type_conflicts(
        &self,
        canonical: &str,
        value_type: &ValueType,
        default: Option<&Value>,
    ) -> Vec<String> {
        let mut conflicts = Vec::new();
        if let Some(default) = default
            && !value_type.validate(default)
        {
            conflicts.push(format!(
                "default value {default} does not conform to {value_type}"
            ));
        }
        for rule in self.rules_for_setting(canonical) {
            if !value_type.validate(&rule.value) {
                conflicts.push(format!(
                    "rule {}: value {} does not conform to {value_type}",
                    rule.id, rule.value
                ));
            }
        }
        conflicts
    }

    /// Rules whose conditions mention features absent from `retained`.
    fn feature_removal_conflicts(&self, canonical: &str, retained: &BTreeSet<String>) -> Vec<String> {
        let mut conflicts = Vec::new();
        for rule in self.rules_for_setting(canonical) {
            for feature in rule.feature_values.keys() {
                if !retained.contains(feature) {
                    conflicts.push(format!("rule {}: condition on {feature}", rule.id));
                }
            }
        }
        conflicts
    }

    /// Change only the value type, surfacing conflicts explicitly.
    pub fn set_setting_type(&mut self, name_or_alias: &str, value_type: ValueType) -> Result<(), StoreError> {
        let Some(record) = self.setting(name_or_alias) else {
            return Err(StoreError::SettingNotFound(name_or_alias.to_string()));
        };
        if record.value_type == value_type {
            return Ok(());
        }
        self.update_setting(
            name_or_alias,
            SettingUpdate {
                value_type: Some(value_type),
                ..SettingUpdate::default()
            },
        )
    }

    /// Replace the configurable-feature set, surfacing rule conflicts.
    pub fn set_configurable_features(
        &mut self,
        name_or_alias: &str,
        features: BTreeSet<String>,
    ) -> Result<(), StoreError> {
        if self.setting(name_or_alias).is_none() {
            return Err(StoreError::SettingNotFound(name_or_alias.to_string()));
        }
        self.update_setting(
            name_or_alias,
            SettingUpdate {
                configurable_features: Some(features),
                ..SettingUpdate::default()
            },
        )
    }

    fn touch_setting(&mut self, canonical: &str) {
        if let Some(record) = self.settings.get_mut(canonical) {
            record.touch();
        }
    }

    // ── Rules ──

    /// Fetch a rule by id.
    pub fn rule(&self, id: u64) -> Option<&RuleRecord> {
        self.rules.get(&id)
    }

    /// All rules of a canonical setting, in id order.
    pub fn rules_for_setting<'a>(&'a self, canonical: &'a str) -> impl Iterator<Item = &'a RuleRecord> {
        self.rules
            .values()
            .filter(move |rule| rule.setting == canonical)
    }

    /// All rules, in id order.
    pub fn rules(&self) -> impl Iterator<Item = &RuleRecord> {
        self.rules.values()
    }

    /// For each configurable feature of a setting, the rules conditioned on it.
    pub fn features_in_use(&self, canonical: &str) -> BTreeMap<String, Vec<u64>> {
        let mut in_use: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for rule in self.rules_for_setting(canonical) {
            for feature in rule.feature_values.keys() {
                in_use.entry(feature.clone()).or_default().push(rule.id);
            }
        }
        in_use
    }

    /// Create a rule and return its fresh id.
    pub fn add_rule(
        &mut self,
        setting: &str,
        feature_values: BTreeMap<String, String>,
        value: Value,
        metadata: BTreeMap<String, Value>,
    ) -> Result<u64, StoreError> {
        let Some(record) = self.setting(setting) else {
            return Err(StoreError::SettingNotFound(setting.to_string()));
        };
        let canonical = record.name.clone();
        if feature_values.is_empty() {
            return Err(StoreError::EmptyConditions);
        }
        let not_configurable: Vec<String> = feature_values
            .keys()
            .filter(|feature| !record.configurable_features.contains(*feature))
            .cloned()
            .collect();
        if !not_configurable.is_empty() {
            return Err(StoreError::NotConfigurable {
                setting: canonical,
                features: not_configurable,
            });
        }
        for (feature, value) in &feature_values {
            if value.is_empty() {
                return Err(StoreError::InvalidConditionValue {
                    feature: feature.clone(),
                });
            }
        }
        if !record.value_type.validate(&value) {
            return Err(StoreError::ValueMismatch {
                value_type: record.value_type.to_string(),
                value: value.to_string(),
            });
        }
        validate_metadata_keys(&metadata)?;
        if let Some(existing) = self.find_rule(&canonical, &feature_values) {
            return Err(StoreError::RuleExists {
                setting: canonical,
                rule_id: existing,
            });
        }
        let id = self.next_rule_id;
        self.next_rule_id += 1;
        self.rules.insert(
            id,
            RuleRecord {
                id,
                setting: canonical.clone(),
                feature_values,
                value,
                metadata,
            },
        );
        self.touch_setting(&canonical);
        self.bump();
        info!(setting = %canonical, rule_id = id, "added rule");
        Ok(id)
    }

    /// Delete a rule by id.
    pub fn delete_rule(&mut self, id: u64) -> Result<(), StoreError> {
        let Some(rule) = self.rules.remove(&id) else {
            return Err(StoreError::RuleNotFound(id));
        };
        self.touch_setting(&rule.setting);
        self.bump();
        info!(setting = %rule.setting, rule_id = id, "deleted rule");
        Ok(())
    }

    /// Look up a rule by setting and exact conditions.
    pub fn search_rule(
        &self,
        setting: &str,
        feature_values: &BTreeMap<String, String>,
    ) -> Result<Option<u64>, StoreError> {
        let Some(record) = self.setting(setting) else {
            return Err(StoreError::SettingNotFound(setting.to_string()));
        };
        let canonical = record.name.clone();
        Ok(self.find_rule(&canonical, feature_values))
    }

    fn find_rule(&self, canonical: &str, feature_values: &BTreeMap<String, String>) -> Option<u64> {
        self.rules_for_setting(canonical)
            .find(|rule| &rule.feature_values == feature_values)
            .map(|rule| rule.id)
    }

    /// Replace a rule's value, validating conformance.
    pub fn set_rule_value(&mut self, id: u64, value: Value) -> Result<(), StoreError> {
        let Some(rule) = self.rules.get(&id) else {
            return Err(StoreError::RuleNotFound(id));
        };
        let setting = rule.setting.clone();
        let record = self
            .settings
            .get(&setting)
            .expect("rules always reference a live setting");
        if !record.value_type.validate(&value) {
            return Err(StoreError::ValueMismatch {
                value_type: record.value_type.to_string(),
                value: value.to_string(),
            });
        }
        self.rules
            .get_mut(&id)
            .expect("rule was just fetched")
            .value = value;
        self.touch_setting(&setting);
        self.bump();
        Ok(())
    }

    // ── Metadata ──

    /// Merge entries into a setting's metadata.
    pub fn update_setting_metadata(
        &mut self,
        name_or_alias: &str,
        entries: BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        validate_metadata_keys(&entries)?;
        let canonical = self.require_setting(name_or_alias)?;
        let record = self.settings.get_mut(&canonical).expect("setting is present");
        record.metadata.extend(entries);
        record.touch();
        self.bump();
        Ok(())
    }

    /// Replace a setting's metadata wholesale. An empty map clears it.
    pub fn replace_setting_metadata(
        &mut self,
        name_or_alias: &str,
        entries: BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        validate_metadata_keys(&entries)?;
        let canonical = self.require_setting(name_or_alias)?;
        let record = self.settings.get_mut(&canonical).expect("setting is present");
        record.metadata = entries;
        record.touch();
        self.bump();
        Ok(())
    }

    /// Set one key of a setting's metadata.
    pub fn put_setting_metadata_key(
        &mut self,
        name_or_alias: &str,
        key: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        if !is_valid_metadata_key(key) {
            return Err(StoreError::InvalidMetadataKey(key.to_string()));
        }
        let canonical = self.require_setting(name_or_alias)?;
        let record = self.settings.get_mut(&canonical).expect("setting is present");
        record.metadata.insert(key.to_string(), value);
        record.touch();
        self.bump();
        Ok(())
    }

    /// Remove one key of a setting's metadata (absent keys are fine).
    pub fn delete_setting_metadata_key(
        &mut self,
        name_or_alias: &str,
        key: &str,
    ) -> Result<(), StoreError> {
        let canonical = self.require_setting(name_or_alias)?;
        let record = self.settings.get_mut(&canonical).expect("setting is present");
        record.metadata.remove(key);
        record.touch();
        self.bump();
        Ok(())
    }

    fn require_setting(&self, name_or_alias: &str) -> Result<String, StoreError> {
        self.resolve_setting_name(name_or_alias)
            .map(str::to_string)
            .ok_or_else(|| StoreError::SettingNotFound(name_or_alias.to_string()))
    }

    /// Merge entries into a rule's metadata.
    pub fn update_rule_metadata(
        &mut self,
        id: u64,
        entries: BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        validate_metadata_keys(&entries)?;
        let Some(rule) = self.rules.get_mut(&id) else {
            return Err(StoreError::RuleNotFound(id));
        };
        rule.metadata.extend(entries);
        self.bump();
        Ok(())
    }

    /// Replace a rule's metadata wholesale. An empty map clears it.
    pub fn replace_rule_metadata(
        &mut self,
        id: u64,
        entries: BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        validate_metadata_keys(&entries)?;
        let Some(rule) = self.rules.get_mut(&id) else {
            return Err(StoreError::RuleNotFound(id));
        };
        rule.metadata = entries;
        self.bump();
        Ok(())
    }

    /// Set one key of a rule's metadata.
    pub fn put_rule_metadata_key(&mut self, id: u64, key: &str, value: Value) -> Result<(), StoreError> {
        if !is_valid_metadata_key(key) {
            return Err(StoreError::InvalidMetadataKey(key.to_string()));
        }
        let Some(rule) = self.rules.get_mut(&id) else {
            return Err(StoreError::RuleNotFound(id));
        };
        rule.metadata.insert(key.to_string(), value);
        self.bump();
        Ok(())
    }

    /// Remove one key of a rule's metadata (absent keys are fine).
    pub fn delete_rule_metadata_key(&mut self, id: u64, key: &str) -> Result<(), StoreError> {
        let Some(rule) = self.rules.get_mut(&id) else {
            return Err(StoreError::RuleNotFound(id));
        };
        rule.metadata.remove(key);
        self.bump();
        Ok(())
    }

    // ── Invariant audit ──

    /// Check every structural invariant, returning human-readable violations.
    ///
    /// An empty result means the state is sound. Used by `settra check-db`
    /// and by snapshot loading.
    pub fn verify_invariants(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let mut feature_names = BTreeSet::new();
        for feature in &self.features {
            if !feature_names.insert(feature) {
                violations.push(format!("context feature {feature} appears twice"));
            }
        }
        for record in self.settings.values() {
            if self.aliases.contains_key(&record.name) {
                violations.push(format!("name {} is both canonical and an alias", record.name));
            }
            for alias in &record.aliases {
                if self.aliases.get(alias).map(String::as_str) != Some(record.name.as_str()) {
                    violations.push(format!(
                        "alias {alias} of setting {} is missing from the alias index",
                        record.name
                    ));
                }
            }
            for feature in &record.configurable_features {
                if !feature_names.contains(feature) {
                    violations.push(format!(
                        "setting {} is configurable by unknown feature {feature}",
                        record.name
                    ));
                }
            }
            if let Some(default) = &record.default_value
                && !record.value_type.validate(default)
            {
                violations.push(format!(
                    "setting {}: default value does not conform to {}",
                    record.name, record.value_type
                ));
            }
        }
        for (alias, canonical) in &self.aliases {
            match self.settings.get(canonical) {
                Some(record) if record.aliases.contains(alias) => {}
                _ => violations.push(format!("alias index entry {alias} -> {canonical} is stale")),
            }
        }
        let mut seen_conditions: BTreeSet<(String, Vec<(String, String)>)> = BTreeSet::new();
        for rule in self.rules.values() {
            let Some(record) = self.settings.get(&rule.setting) else {
                violations.push(format!("rule {} references unknown setting {}", rule.id, rule.setting));
                continue;
            };
            if rule.feature_values.is_empty() {
                violations.push(format!("rule {} has no conditions", rule.id));
            }
            for feature in rule.feature_values.keys() {
                if !record.configurable_features.contains(feature) {
                    violations.push(format!(
                        "rule {}: condition on {feature} outside the configurable features of {}",
                        rule.id, rule.setting
                    ));
                }
            }
            if !record.value_type.validate(&rule.value) {
                violations.push(format!(
                    "rule {}: value does not conform to {}",
                    rule.id, record.value_type
                ));
            }
            if rule.id >= self.next_rule_id {
                violations.push(format!("rule {} is at or above the id watermark", rule.id));
            }
            let key = (
                rule.setting.clone(),
                rule.feature_values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
            if !seen_conditions.insert(key) {
                violations.push(format!("rule {}: duplicate conditions for {}", rule.id, rule.setting));
            }
        }
        violations
    }

    pub(crate) fn parts(&self) -> (&[String], Vec<&SettingRecord>, Vec<&RuleRecord>, u64, u64) {
        (
            &self.features,
            self.settings.values().collect(),
            self.rules.values().collect(),
            self.next_rule_id,
            self.stamp,
        )
    }
}

fn validate_metadata_keys(metadata: &BTreeMap<String, Value>) -> Result<(), StoreError> {
    for key in metadata.keys() {
        if !is_valid_metadata_key(key) {
            return Err(StoreError::InvalidMetadataKey(key.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_features(features: &[&str]) -> StateStore {
        let mut store = StateStore::new();
        for feature in features {
            store.add_context_feature(feature).expect("feature should add");
        }
        store
    }

    fn int_setting(name: &str, features: &[&str]) -> SettingRecord {
        SettingRecord::new(
            name,
            ValueType::parse("int").expect("type should parse"),
            Some(json!(0)),
            features.iter().map(|f| f.to_string()),
        )
    }

    fn conditions(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn feature_indices_stay_contiguous() {
        let mut store = store_with_features(&["account", "user", "theme"]);
        assert_eq!(store.context_feature_index("user"), Some(1));
        store.delete_context_feature("user").expect("delete should succeed");
        assert_eq!(store.context_features(), ["account", "theme"]);
        assert_eq!(store.context_feature_index("theme"), Some(1));
    }

    #[test]
    fn duplicate_features_conflict() {
        let mut store = store_with_features(&["account"]);
        let err = store.add_context_feature("account").expect_err("duplicate must fail");
        assert!(matches!(err, StoreError::FeatureExists(name) if name == "account"));
    }

    #[test]
    fn move_before_and_after_use_post_removal_pivot() {
        let mut store = store_with_features(&["a", "b", "c", "d"]);
        store
            .move_context_feature("a", MoveAnchor::After("c".to_string()))
            .expect("move should succeed");
        assert_eq!(store.context_features(), ["b", "c", "a", "d"]);

        store
            .move_context_feature("d", MoveAnchor::Before("b".to_string()))
            .expect("move should succeed");
        assert_eq!(store.context_features(), ["d", "b", "c", "a"]);
    }

    #[test]
    fn self_anchored_moves_are_no_ops() {
        let mut store = store_with_features(&["a", "b"]);
        let stamp = store.stamp();
        store
            .move_context_feature("a", MoveAnchor::Before("a".to_string()))
            .expect("self move should be a no-op");
        store
            .move_context_feature("a", MoveAnchor::After("a".to_string()))
            .expect("self move should be a no-op");
        assert_eq!(store.context_features(), ["a", "b"]);
        assert_eq!(store.stamp(), stamp);
    }

    #[test]
    fn delete_is_guarded_by_configurable_settings() {
        let mut store = store_with_features(&["theme"]);
        store
            .insert_setting(int_setting("cache_size", &["theme"]))
            .expect("setting should insert");
        let err = store
            .delete_context_feature("theme")
            .expect_err("in-use feature must not delete");
        assert!(matches!(err, StoreError::FeatureInUse { .. }));

        store.delete_setting("cache_size").expect("setting should delete");
        store.delete_context_feature("theme").expect("feature should delete");
    }

    #[test]
    fn ensure_context_features_inserts_missing_in_expected_order() {
        let mut store = store_with_features(&["b", "d"]);
        let expected: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        store
            .ensure_context_features(&expected)
            .expect("reconciliation should succeed");
        assert_eq!(store.context_features(), expected.as_slice());
    }

    #[test]
    fn ensure_context_features_rejects_order_disagreement() {
        let mut store = store_with_features(&["b", "a"]);
        let expected: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let err = store
            .ensure_context_features(&expected)
            .expect_err("order disagreement must fail");
        assert!(matches!(err, StoreError::Reconcile(_)));
    }

    #[test]
    fn ensure_context_features_rejects_unexpected_stored_feature() {
        let mut store = store_with_features(&["a", "z"]);
        let expected: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert!(store.ensure_context_features(&expected).is_err());
    }

    #[test]
    fn names_and_aliases_share_one_namespace() {
        let mut store = store_with_features(&["user"]);
        store
            .insert_setting(int_setting("foo", &["user"]))
            .expect("setting should insert");
        store.rename_setting("foo", "bar").expect("rename should succeed");

        let err = store
            .insert_setting(int_setting("foo", &["user"]))
            .expect_err("alias name must be taken");
        assert!(matches!(err, StoreError::NameTaken(name) if name == "foo"));

        let record = store.setting("foo").expect("alias should resolve");
        assert_eq!(record.name, "bar");
        assert!(record.aliases.contains("foo"));
    }

    #[test]
    fn rename_chains_accumulate_aliases_and_follow_rules() {
        let mut store = store_with_features(&["user"]);
        store
            .insert_setting(int_setting("foo", &["user"]))
            .expect("setting should insert");
        let rule_id = store
            .add_rule("foo", conditions(&[("user", "admin")]), json!(7), BTreeMap::new())
            .expect("rule should add");

        store.rename_setting("foo", "bar").expect("rename should succeed");
        store.rename_setting("bar", "baz").expect("rename should succeed");

        let record = store.setting("baz").expect("setting should resolve");
        assert_eq!(
            record.aliases.iter().cloned().collect::<Vec<_>>(),
            vec!["bar".to_string(), "foo".to_string()]
        );
        assert_eq!(store.rule(rule_id).expect("rule should exist").setting, "baz");
        assert_eq!(store.setting("foo").expect("old alias resolves").name, "baz");
    }

    #[test]
    fn renaming_to_an_alias_promotes_it() {
        let mut store = store_with_features(&["user"]);
        store
            .insert_setting(int_setting("foo", &["user"]))
            .expect("setting should insert");
        store.rename_setting("foo", "bar").expect("rename should succeed");
        store.rename_setting("bar", "foo").expect("promotion should succeed");

        let record = store.setting("foo").expect("setting should resolve");
        assert_eq!(record.name, "foo");
        assert_eq!(record.aliases.iter().cloned().collect::<Vec<_>>(), vec!["bar".to_string()]);
    }

    #[test]
    fn add_rule_validates_everything() {
        let mut store = store_with_features(&["user", "theme"]);
        store
            .insert_setting(int_setting("cache_size", &["user"]))
            .expect("setting should insert");

        let err = store
            .add_rule("cache_size", BTreeMap::new(), json!(1), BTreeMap::new())
            .expect_err("empty conditions must fail");
        assert!(matches!(err, StoreError::EmptyConditions));

        let err = store
            .add_rule("cache_size", conditions(&[("theme", "dark")]), json!(1), BTreeMap::new())
            .expect_err("unconfigurable feature must fail");
        assert!(matches!(err, StoreError::NotConfigurable { .. }));

        let err = store
            .add_rule("cache_size", conditions(&[("user", "")]), json!(1), BTreeMap::new())
            .expect_err("empty condition value must fail");
        assert!(matches!(err, StoreError::InvalidConditionValue { .. }));

        let err = store
            .add_rule("cache_size", conditions(&[("user", "john")]), json!("x"), BTreeMap::new())
            .expect_err("mismatched value must fail");
        assert!(matches!(err, StoreError::ValueMismatch { .. }));

        let id = store
            .add_rule("cache_size", conditions(&[("user", "john")]), json!(5), BTreeMap::new())
            .expect("rule should add");
        let err = store
            .add_rule("cache_size", conditions(&[("user", "john")]), json!(9), BTreeMap::new())
            .expect_err("duplicate conditions must conflict");
        assert!(matches!(err, StoreError::RuleExists { rule_id, .. } if rule_id == id));
    }

    #[test]
    fn search_matches_exact_conditions_only() {
        let mut store = store_with_features(&["account", "user"]);
        store
            .insert_setting(int_setting("cache_size", &["account", "user"]))
            .expect("setting should insert");
        let id = store
            .add_rule(
                "cache_size",
                conditions(&[("account", "jim"), ("user", "admin")]),
                json!(200),
                BTreeMap::new(),
            )
            .expect("rule should add");

        let found = store
            .search_rule("cache_size", &conditions(&[("user", "admin"), ("account", "jim")]))
            .expect("search should succeed");
        assert_eq!(found, Some(id));

        let found = store
            .search_rule("cache_size", &conditions(&[("account", "jim")]))
            .expect("search should succeed");
        assert_eq!(found, None);

        let err = store
            .search_rule("missing", &conditions(&[("account", "jim")]))
            .expect_err("unknown setting must fail");
        assert!(matches!(err, StoreError::SettingNotFound(_)));
    }

    #[test]
    fn delete_setting_cascades_to_rules() {
        let mut store = store_with_features(&["user"]);
        store
            .insert_setting(int_setting("cache_size", &["user"]))
            .expect("setting should insert");
        let id = store
            .add_rule("cache_size", conditions(&[("user", "guest")]), json!(10), BTreeMap::new())
            .expect("rule should add");

        store.delete_setting("cache_size").expect("setting should delete");
        assert!(store.rule(id).is_none());
        assert!(store.setting("cache_size").is_none());
    }

    #[test]
    fn set_rule_value_checks_conformance() {
        let mut store = store_with_features(&["user"]);
        store
            .insert_setting(int_setting("cache_size", &["user"]))
            .expect("setting should insert");
        let id = store
            .add_rule("cache_size", conditions(&[("user", "guest")]), json!(10), BTreeMap::new())
            .expect("rule should add");

        let err = store
            .set_rule_value(id, json!("ten"))
            .expect_err("mismatched value must fail");
        assert!(matches!(err, StoreError::ValueMismatch { .. }));
        store.set_rule_value(id, json!(20)).expect("value should update");
        assert_eq!(store.rule(id).expect("rule should exist").value, json!(20));
    }

    #[test]
    fn type_change_surfaces_rule_conflicts() {
        let mut store = store_with_features(&["user"]);
        let level = SettingRecord::new(
            "level",
            ValueType::parse("Enum[\"high\",\"low\",\"mid\"]").expect("type should parse"),
            Some(json!("mid")),
            ["user".to_string()],
        );
        store.insert_setting(level).expect("setting should insert");
        store
            .add_rule("level", conditions(&[("user", "guest")]), json!("low"), BTreeMap::new())
            .expect("rule should add");

        let narrowed = ValueType::parse("Enum[\"high\",\"mid\"]").expect("type should parse");
        let err = store
            .set_setting_type("level", narrowed)
            .expect_err("conflicting type change must fail");
        match err {
            StoreError::TypeConflicts { conflicts, .. } => {
                assert_eq!(conflicts.len(), 1);
                assert!(conflicts[0].contains("\"low\""));
            }
            other => panic!("expected type conflicts, got {other:?}"),
        }
    }

    #[test]
    fn configurable_feature_removal_is_guarded_by_rules() {
        let mut store = store_with_features(&["account", "user"]);
        store
            .insert_setting(int_setting("cache_size", &["account", "user"]))
            .expect("setting should insert");
        store
            .add_rule("cache_size", conditions(&[("user", "guest")]), json!(10), BTreeMap::new())
            .expect("rule should add");

        let err = store
            .set_configurable_features("cache_size", ["account".to_string()].into_iter().collect())
            .expect_err("removal of a used feature must fail");
        assert!(matches!(err, StoreError::FeaturesInUseByRules { .. }));

        store
            .set_configurable_features(
                "cache_size",
                ["account".to_string(), "user".to_string()].into_iter().collect(),
            )
            .expect("keeping used features should succeed");
    }

    #[test]
    fn metadata_operations_merge_replace_and_delete() {
        let mut store = store_with_features(&["user"]);
        store
            .insert_setting(int_setting("cache_size", &["user"]))
            .expect("setting should insert");

        store
            .update_setting_metadata(
                "cache_size",
                [("owner".to_string(), json!("infra"))].into_iter().collect(),
            )
            .expect("merge should succeed");
        store
            .update_setting_metadata(
                "cache_size",
                [("tier".to_string(), json!(2))].into_iter().collect(),
            )
            .expect("merge should succeed");
        assert_eq!(store.setting("cache_size").expect("setting").metadata.len(), 2);

        store
            .put_setting_metadata_key("cache_size", "tier", json!(3))
            .expect("put key should succeed");
        assert_eq!(
            store.setting("cache_size").expect("setting").metadata["tier"],
            json!(3)
        );

        store
            .delete_setting_metadata_key("cache_size", "owner")
            .expect("delete key should succeed");
        store
            .replace_setting_metadata("cache_size", BTreeMap::new())
            .expect("clear should succeed");
        assert!(store.setting("cache_size").expect("setting").metadata.is_empty());

        let err = store
            .put_setting_metadata_key("cache_size", "bad key", json!(1))
            .expect_err("bad key must fail");
        assert!(matches!(err, StoreError::InvalidMetadataKey(_)));
    }

    #[test]
    fn every_mutation_bumps_the_stamp() {
        let mut store = store_with_features(&["user"]);
        let before = store.stamp();
        store
            .insert_setting(int_setting("cache_size", &["user"]))
            .expect("setting should insert");
        let after_insert = store.stamp();
        assert!(after_insert > before);
        store
            .add_rule("cache_size", conditions(&[("user", "guest")]), json!(1), BTreeMap::new())
            .expect("rule should add");
        assert!(store.stamp() > after_insert);
    }

    #[test]
    fn verify_invariants_accepts_a_sound_store() {
        let mut store = store_with_features(&["user"]);
        store
            .insert_setting(int_setting("cache_size", &["user"]))
            .expect("setting should insert");
        store
            .add_rule("cache_size", conditions(&[("user", "guest")]), json!(1), BTreeMap::new())
            .expect("rule should add");
        assert!(store.verify_invariants().is_empty());
    }
}
