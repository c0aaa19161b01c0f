//! The declaration state machine.
//!
//! A declaration asserts a setting's full shape at a version. Comparing it
//! against the stored setting yields a list of classified differences, and
//! the declared version decides whether those differences may be applied.

use serde::{Serialize, Serializer};
use serde_json::Value;
use settra_store::{SettingRecord, SettingUpdate, StateStore, StoreError};
use settra_types::{SettingVersion, ValueType};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::info;

/// A client-submitted declaration.
#[derive(Debug, Clone)]
pub struct DeclarationInput {
    pub name: String,
    pub configurable_features: Vec<String>,
    pub value_type: ValueType,
    pub default_value: Option<Value>,
    pub metadata: BTreeMap<String, Value>,
    pub alias: Option<String>,
    pub version: SettingVersion,
}

/// How big a declared change is.
///
/// The order matters: the largest level across all differences decides the
/// outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiffLevel {
    Minor,
    Major,
    Mismatch,
}

impl fmt::Display for DiffLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minor => f.write_str("minor"),
            Self::Major => f.write_str("major"),
            Self::Mismatch => f.write_str("mismatch"),
        }
    }
}

/// One classified difference between a declaration and the stored setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference {
    pub level: DiffLevel,
    pub description: String,
}

impl Difference {
    fn new(level: DiffLevel, description: impl Into<String>) -> Self {
        Self {
            level,
            description: description.into(),
        }
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level, self.description)
    }
}

// On the wire a difference is its rendered form.
impl Serialize for Difference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The result of a declaration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeclarationOutcome {
    /// The setting did not exist and was created.
    Created,
    /// The declaration matches the stored setting at the same version.
    Uptodate,
    /// The declared version is behind the stored one; nothing changed.
    Outdated {
        latest_version: SettingVersion,
        differences: Vec<Difference>,
    },
    /// The declared version is ahead and the differences fit the bump.
    Upgraded {
        previous_version: SettingVersion,
        differences: Vec<Difference>,
    },
    /// The declared version is ahead but the differences do not fit the bump.
    Rejected {
        previous_version: SettingVersion,
        differences: Vec<Difference>,
    },
    /// Same version, different attributes (or a version that cannot create).
    Mismatch { differences: Vec<Difference> },
}

impl DeclarationOutcome {
    /// Whether the outcome is reported as a conflict (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Mismatch { .. })
    }
}

/// Errors that abort a declaration before an outcome is reached.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeclareError {
    #[error("name {0:?} and alias must differ")]
    AliasEqualsName(String),

    #[error("alias {0} does not exist")]
    AliasNotFound(String),

    #[error("alias {alias} is an alias of unrelated setting {canonical}")]
    AliasMismatch { alias: String, canonical: String },

    #[error("{0:?} are not acceptable context features")]
    UnknownContextFeatures(Vec<String>),

    #[error("newly declared settings must include a default value")]
    MissingDefault,

    #[error("type {value_type} and default value {default} must match")]
    DefaultMismatch { value_type: String, default: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run a declaration against the store.
pub fn declare(
    store: &mut StateStore,
    input: DeclarationInput,
) -> Result<DeclarationOutcome, DeclareError> {
    if let Some(alias) = &input.alias
        && alias == &input.name
    {
        return Err(DeclareError::AliasEqualsName(input.name.clone()));
    }
    if let Some(default) = &input.default_value
        && !input.value_type.validate(default)
    {
        return Err(DeclareError::DefaultMismatch {
            value_type: input.value_type.to_string(),
            default: default.to_string(),
        });
    }

    let existing = resolve_declared_setting(store, &input)?;

    let Some(existing) = existing else {
        return create_setting(store, input);
    };

    let differences = classify_differences(store, &existing, &input)?;
    decide(store, existing, input, differences)
}

/// Resolve the stored setting a declaration addresses, honoring the alias
/// contract: a supplied alias must either be a known alias of the setting
/// found by name, or (when the name is new) the canonical name being
/// renamed away from.
fn resolve_declared_setting(
    store: &StateStore,
    input: &DeclarationInput,
) -> Result<Option<SettingRecord>, DeclareError> {
    let by_name = store.setting(&input.name).cloned();
    let Some(alias) = &input.alias else {
        return Ok(by_name);
    };
    let Some(alias_canonical) = store.resolve_setting_name(alias).map(str::to_string) else {
        return Err(DeclareError::AliasNotFound(alias.clone()));
    };
    match by_name {
        Some(record) if record.name == alias_canonical => Ok(Some(record)),
        Some(_) => Err(DeclareError::AliasMismatch {
            alias: alias.clone(),
            canonical: alias_canonical,
        }),
        None if alias == &alias_canonical => Ok(store.setting(&alias_canonical).cloned()),
        None => Err(DeclareError::AliasMismatch {
            alias: alias.clone(),
            canonical: alias_canonical,
        }),
    }
}

fn create_setting(
    store: &mut StateStore,
    input: DeclarationInput,
) -> Result<DeclarationOutcome, DeclareError> {
    if input.version != SettingVersion::INITIAL {
        return Ok(DeclarationOutcome::Mismatch {
            differences: vec![Difference::new(
                DiffLevel::Mismatch,
                format!(
                    "setting does not exist yet, but was declared at version {}",
                    input.version
                ),
            )],
        });
    }
    let unknown = store.unknown_context_features(input.configurable_features.iter());
    if !unknown.is_empty() {
        return Err(DeclareError::UnknownContextFeatures(unknown));
    }
    if input.default_value.is_none() {
        return Err(DeclareError::MissingDefault);
    }
    let mut record = SettingRecord::new(
        input.name,
        input.value_type,
        input.default_value,
        input.configurable_features,
    );
    record.metadata = input.metadata;
    store.insert_setting(record)?;
    Ok(DeclarationOutcome::Created)
}

/// Classify every attribute difference between the stored setting and the
/// declaration. Pure over the store's read surface, so every cell of the
/// decision matrix is testable in isolation.
fn classify_differences(
    store: &StateStore,
    existing: &SettingRecord,
    input: &DeclarationInput,
) -> Result<Vec<Difference>, DeclareError> {
    let mut differences = Vec::new();

    // configurable features
    let declared_features: BTreeSet<String> = input.configurable_features.iter().cloned().collect();
    if declared_features != existing.configurable_features {
        let removed: Vec<&String> = existing
            .configurable_features
            .difference(&declared_features)
            .collect();
        let in_use = store.features_in_use(&existing.name);
        let removed_in_use: Vec<&String> = removed
            .iter()
            .copied()
            .filter(|feature| in_use.contains_key(*feature))
            .collect();
        if !removed_in_use.is_empty() {
            let rule_ids: Vec<u64> = removed_in_use
                .iter()
                .flat_map(|feature| in_use[feature.as_str()].iter().copied())
                .collect();
            differences.push(Difference::new(
                DiffLevel::Mismatch,
                format!(
                    "configurable features {removed_in_use:?} are still in use by rules {rule_ids:?}"
                ),
            ));
        } else if declared_features.is_subset(&existing.configurable_features) {
            differences.push(Difference::new(
                DiffLevel::Minor,
                format!("removal of configurable features {removed:?}"),
            ));
        } else {
            let unknown = store.unknown_context_features(declared_features.iter());
            if !unknown.is_empty() {
                return Err(DeclareError::UnknownContextFeatures(unknown));
            }
            differences.push(Difference::new(
                DiffLevel::Major,
                format!(
                    "change of configurable features from {:?} to {declared_features:?}",
                    existing.configurable_features
                ),
            ));
        }
    }

    // type
    if input.value_type != existing.value_type {
        if input.value_type.is_subtype_of(&existing.value_type) {
            differences.push(Difference::new(
                DiffLevel::Minor,
                format!(
                    "change of type from {} to subtype {}",
                    existing.value_type, input.value_type
                ),
            ));
        } else {
            let effective_default = input
                .default_value
                .as_ref()
                .or(existing.default_value.as_ref());
            let conflicts = store.type_conflicts(&existing.name, &input.value_type, effective_default);
            if conflicts.is_empty() {
                differences.push(Difference::new(
                    DiffLevel::Major,
                    format!(
                        "change of type from {} to {}",
                        existing.value_type, input.value_type
                    ),
                ));
            } else {
                differences.push(Difference::new(
                    DiffLevel::Mismatch,
                    format!("setting type incompatible with existing values: {conflicts:?}"),
                ));
            }
        }
    }

    // rename (reachable only through the alias path)
    if input.name != existing.name {
        differences.push(Difference::new(
            DiffLevel::Minor,
            format!("rename of setting from {} to {}", existing.name, input.name),
        ));
    }

    // default value
    if let Some(default) = &input.default_value
        && Some(default) != existing.default_value.as_ref()
    {
        let existing_default = existing
            .default_value
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "none".to_string());
        differences.push(Difference::new(
            DiffLevel::Minor,
            format!("change of default value from {existing_default} to {default}"),
        ));
    }

    // metadata, key by key
    let keys: BTreeSet<&String> = existing.metadata.keys().chain(input.metadata.keys()).collect();
    for key in keys {
        match (existing.metadata.get(key), input.metadata.get(key)) {
            (None, Some(value)) => differences.push(Difference::new(
                DiffLevel::Minor,
                format!("addition of metadata key {key} {value}"),
            )),
            (Some(_), None) => differences.push(Difference::new(
                DiffLevel::Minor,
                format!("removal of metadata key {key}"),
            )),
            (Some(old), Some(new)) if old != new => differences.push(Difference::new(
                DiffLevel::Minor,
                format!("change of metadata key {key} from {old} to {new}"),
            )),
            _ => {}
        }
    }

    differences.sort_by(|a, b| b.level.cmp(&a.level).then(a.description.cmp(&b.description)));
    Ok(differences)
}

fn decide(
    store: &mut StateStore,
    existing: SettingRecord,
    input: DeclarationInput,
    differences: Vec<Difference>,
) -> Result<DeclarationOutcome, DeclareError> {
    if input.version == existing.version {
        if differences.is_empty() {
            return Ok(DeclarationOutcome::Uptodate);
        }
        // same version, different attributes: every difference is a mismatch
        let differences = differences
            .into_iter()
            .map(|diff| Difference::new(DiffLevel::Mismatch, diff.description))
            .collect();
        return Ok(DeclarationOutcome::Mismatch { differences });
    }

    if input.version < existing.version {
        return Ok(DeclarationOutcome::Outdated {
            latest_version: existing.version,
            differences,
        });
    }

    let max_level = differences.iter().map(|diff| diff.level).max();
    let accepted = match max_level {
        Some(DiffLevel::Mismatch) => false,
        Some(DiffLevel::Major) => input.version.major > existing.version.major,
        Some(DiffLevel::Minor) | None => true,
    };
    if !accepted {
        return Ok(DeclarationOutcome::Rejected {
            previous_version: existing.version,
            differences,
        });
    }

    let declared_features: BTreeSet<String> = input.configurable_features.iter().cloned().collect();
    let update = SettingUpdate {
        rename: (input.name != existing.name).then(|| input.name.clone()),
        value_type: (input.value_type != existing.value_type).then_some(input.value_type),
        default_value: input
            .default_value
            .filter(|default| Some(default) != existing.default_value.as_ref()),
        metadata: (input.metadata != existing.metadata).then_some(input.metadata),
        configurable_features: (declared_features != existing.configurable_features)
            .then_some(declared_features),
        version: Some(input.version),
    };
    store.update_setting(&existing.name, update)?;
    info!(
        setting = %existing.name,
        version = %input.version,
        "upgraded setting declaration"
    );
    Ok(DeclarationOutcome::Upgraded {
        previous_version: existing.version,
        differences,
    })
}
