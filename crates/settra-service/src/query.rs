//! The query engine: context filters, rule matching, registry-ordered output.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use settra_store::{RuleRecord, StateStore};
use settra_types::is_valid_name;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// What values a single context feature may take in a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureFilter {
    /// Any exact-match condition on this feature is acceptable.
    Any,
    /// Only conditions on one of these values are acceptable.
    Values(BTreeSet<String>),
}

/// A caller-supplied description of the contexts it may evaluate in.
///
/// A rule is rejected exactly when it carries a condition the filter cannot
/// satisfy; a rule with no condition on a feature is never rejected by that
/// feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextFilter {
    /// The top-level wildcard: every rule matches.
    All,
    /// Per-feature constraints. Features not listed here forbid conditions.
    Features(BTreeMap<String, FeatureFilter>),
}

/// Errors from parsing the textual filter form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("malformed context filter near {0:?}")]
    Syntax(String),

    #[error("context name repeated in context filter: {0}")]
    DuplicateFeature(String),
}

impl ContextFilter {
    /// Parse the wire form: `*`, the empty string, or comma-separated
    /// `feature:*` / `feature:(v1,v2)` entries.
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        if raw == "*" {
            return Ok(Self::All);
        }
        let mut filters = BTreeMap::new();
        let mut rest = raw;
        while !rest.is_empty() {
            let Some((feature, after_name)) = rest.split_once(':') else {
                return Err(FilterError::Syntax(rest.to_string()));
            };
            if !is_valid_name(feature) {
                return Err(FilterError::Syntax(feature.to_string()));
            }
            let (filter, remainder) = if let Some(after_star) = after_name.strip_prefix('*') {
                (FeatureFilter::Any, after_star)
            } else if let Some(after_paren) = after_name.strip_prefix('(') {
                let Some((values, remainder)) = after_paren.split_once(')') else {
                    return Err(FilterError::Syntax(after_name.to_string()));
                };
                let mut set = BTreeSet::new();
                for value in values.split(',') {
                    if !is_valid_name(value) {
                        return Err(FilterError::Syntax(value.to_string()));
                    }
                    set.insert(value.to_string());
                }
                (FeatureFilter::Values(set), remainder)
            } else {
                return Err(FilterError::Syntax(after_name.to_string()));
            };
            if filters.insert(feature.to_string(), filter).is_some() {
                return Err(FilterError::DuplicateFeature(feature.to_string()));
            }
            rest = match remainder.strip_prefix(',') {
                Some(next) if !next.is_empty() => next,
                Some(_) => return Err(FilterError::Syntax(remainder.to_string())),
                None if remainder.is_empty() => remainder,
                None => return Err(FilterError::Syntax(remainder.to_string())),
            };
        }
        Ok(Self::Features(filters))
    }

    /// Whether a rule's exact-match conditions are all acceptable.
    pub fn allows(&self, conditions: &BTreeMap<String, String>) -> bool {
        match self {
            Self::All => true,
            Self::Features(filters) => conditions.iter().all(|(feature, value)| {
                match filters.get(feature) {
                    None => false,
                    Some(FeatureFilter::Any) => true,
                    Some(FeatureFilter::Values(values)) => values.contains(value),
                }
            }),
        }
    }

    /// Drop constraints on unregistered features; they can never reject a
    /// rule, since no rule may reference them.
    fn retain_known(self, store: &StateStore) -> Self {
        match self {
            Self::All => Self::All,
            Self::Features(mut filters) => {
                let unknown: Vec<String> = filters
                    .keys()
                    .filter(|feature| store.context_feature_index(feature).is_none())
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    info!(unknown_context_features = ?unknown, "unknown context features included in query");
                    for feature in &unknown {
                        filters.remove(feature);
                    }
                }
                Self::Features(filters)
            }
        }
    }
}

/// A query over the rule store.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// `None` means every setting; an empty list means none.
    pub settings: Option<Vec<String>>,
    pub filter: ContextFilter,
    pub include_metadata: bool,
}

/// One matching rule, with conditions in registry order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedRule {
    pub value: Value,
    pub feature_values: Vec<(String, String)>,
    pub rule_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

/// Per-setting query results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingResults {
    pub rules: Vec<MatchedRule>,
    pub default_value: Option<Value>,
}

/// The whole query response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutput {
    pub settings: BTreeMap<String, SettingResults>,
}

/// Errors from running a query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("the following are not setting names: {0:?}")]
    UnknownSettings(Vec<String>),

    #[error("got cache time in the future")]
    CacheTimeInFuture,
}

/// Run a query, returning matching rules and defaults per setting.
pub fn query_rules(store: &StateStore, request: QueryRequest) -> Result<QueryOutput, QueryError> {
    let names = resolve_settings(store, request.settings.as_deref())?;
    let filter = request.filter.retain_known(store);

    let mut settings = BTreeMap::new();
    for name in names {
        let record = store.setting(&name).expect("resolved setting is present");
        let rules = matching_rules(store, &name, &filter, request.include_metadata);
        settings.insert(
            name,
            SettingResults {
                rules,
                default_value: record.default_value.clone(),
            },
        );
    }
    Ok(QueryOutput { settings })
}

/// The deprecated body-based query: explicit setting names only, with
/// settings untouched since `cache_time` skipped from the result.
pub fn query_rules_since(
    store: &StateStore,
    setting_names: &[String],
    filter: ContextFilter,
    cache_time: Option<DateTime<Utc>>,
    include_metadata: bool,
) -> Result<BTreeMap<String, Vec<MatchedRule>>, QueryError> {
    if let Some(cache_time) = cache_time
        && cache_time > Utc::now()
    {
        return Err(QueryError::CacheTimeInFuture);
    }
    let names = resolve_settings(store, Some(setting_names))?;
    let filter = filter.retain_known(store);

    let mut results = BTreeMap::new();
    for name in names {
        let record = store.setting(&name).expect("resolved setting is present");
        if let Some(cache_time) = cache_time
            && record.last_touch < cache_time
        {
            continue;
        }
        results.insert(
            name.clone(),
            matching_rules(store, &name, &filter, include_metadata),
        );
    }
    Ok(results)
}

fn resolve_settings(
    store: &StateStore,
    requested: Option<&[String]>,
) -> Result<Vec<String>, QueryError> {
    match requested {
        None => Ok(store.settings().map(|record| record.name.clone()).collect()),
        Some(names) => {
            let mut resolved = Vec::with_capacity(names.len());
            let mut unknown = Vec::new();
            for name in names {
                match store.resolve_setting_name(name) {
                    Some(canonical) => resolved.push(canonical.to_string()),
                    None => unknown.push(name.clone()),
                }
            }
            if !unknown.is_empty() {
                return Err(QueryError::UnknownSettings(unknown));
            }
            resolved.dedup();
            Ok(resolved)
        }
    }
}

fn matching_rules(
    store: &StateStore,
    canonical: &str,
    filter: &ContextFilter,
    include_metadata: bool,
) -> Vec<MatchedRule> {
    store
        .rules_for_setting(canonical)
        .filter(|rule| filter.allows(&rule.feature_values))
        .map(|rule| shape_rule(store, rule, include_metadata))
        .collect()
}

fn shape_rule(store: &StateStore, rule: &RuleRecord, include_metadata: bool) -> MatchedRule {
    let mut feature_values: Vec<(String, String)> = rule
        .feature_values
        .iter()
        .map(|(feature, value)| (feature.clone(), value.clone()))
        .collect();
    feature_values.sort_by_key(|(feature, _)| {
        store
            .context_feature_index(feature)
            .expect("rule conditions reference registered features")
    });
    MatchedRule {
        value: rule.value.clone(),
        feature_values,
        rule_id: rule.id,
        metadata: include_metadata.then(|| rule.metadata.clone()),
    }
}
