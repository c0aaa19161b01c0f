//! `/api/v1/rules` handlers.

use super::{json_body, metadata, method_not_allowed, persist_or_fail, store_error_response};
use crate::http::{HttpResponse, Request};
use crate::state::DbState;
use serde::Deserialize;
use serde_json::{Value, json};
use settra_store::StateStore;
use std::collections::BTreeMap;

pub fn route(db: &DbState, request: &Request, rest: &[&str]) -> HttpResponse {
    match (request.method.as_str(), rest) {
        ("POST", []) => {
            let input: AddRuleInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let mut store = db.write();
            match store.add_rule(&input.setting, input.feature_values, input.value, input.metadata)
            {
                Ok(rule_id) => {
                    persist_or_fail(db, &store, HttpResponse::json(201, json!({ "rule_id": rule_id })))
                }
                Err(err) => store_error_response(err),
            }
        }
        ("POST", ["search"]) => {
            let input: SearchRuleInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            if input.feature_values.is_empty() {
                return HttpResponse::error(422, "feature_values must not be empty");
            }
            search(&db.read(), &input.setting, &input.feature_values)
        }
        ("GET", ["search"]) => {
            let Some(setting) = request.query.get("setting") else {
                return HttpResponse::error(422, "missing setting query parameter");
            };
            let raw = request.query.get("feature_values").map(String::as_str).unwrap_or("");
            let feature_values = match parse_feature_values(raw) {
                Ok(values) => values,
                Err(response) => return response,
            };
            search(&db.read(), setting, &feature_values)
        }
        (method, [id, rest @ ..]) => {
            let Ok(rule_id) = id.parse::<u64>() else {
                return HttpResponse::error(404, format!("rule not found: {id}"));
            };
            match (method, rest) {
                ("GET", []) => {
                    let store = db.read();
                    match store.rule(rule_id) {
                        Some(rule) => HttpResponse::json(
                            200,
                            json!({
                                "setting": rule.setting,
                                "value": rule.value,
                                "feature_values": ordered_conditions(&store, &rule.feature_values),
                                "metadata": rule.metadata,
                            }),
                        ),
                        None => HttpResponse::error(404, format!("rule not found: {rule_id}")),
                    }
                }
                ("DELETE", []) => {
                    let mut store = db.write();
                    match store.delete_rule(rule_id) {
                        Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                        Err(err) => store_error_response(err),
                    }
                }
                // deprecated alias of PUT {id}/value
                ("PATCH", []) | ("PUT", ["value"]) => {
                    let input: RuleValueInput = match json_body(request) {
                        Ok(input) => input,
                        Err(response) => return response,
                    };
                    let mut store = db.write();
                    match store.set_rule_value(rule_id, input.value) {
                        Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                        Err(err) => store_error_response(err),
                    }
                }
                (_, ["metadata", key_rest @ ..]) => {
                    metadata::route_rule_metadata(db, request, rule_id, key_rest)
                }
                (_, [] | ["value"]) => method_not_allowed(request),
                _ => HttpResponse::error(404, format!("unknown route: {}", request.path)),
            }
        }
        _ => method_not_allowed(request),
    }
}

fn search(store: &StateStore, setting: &str, feature_values: &BTreeMap<String, String>) -> HttpResponse {
    match store.search_rule(setting, feature_values) {
        Ok(Some(rule_id)) => HttpResponse::json(200, json!({ "rule_id": rule_id })),
        Ok(None) => HttpResponse::error(404, "no rule matches the given conditions"),
        Err(err) => store_error_response(err),
    }
}

/// Parse the `f1:v1,f2:v2` form of the search query parameter.
fn parse_feature_values(raw: &str) -> Result<BTreeMap<String, String>, HttpResponse> {
    let mut values = BTreeMap::new();
    for pair in raw.split(',') {
        if pair.is_empty() {
            continue;
        }
        let Some((feature, value)) = pair.split_once(':') else {
            return Err(HttpResponse::error(
                422,
                format!("malformed feature_values entry: {pair:?}"),
            ));
        };
        values.insert(feature.to_string(), value.to_string());
    }
    if values.is_empty() {
        return Err(HttpResponse::error(422, "feature_values must not be empty"));
    }
    Ok(values)
}

/// A rule's conditions as pairs in registry order.
pub(crate) fn ordered_conditions(
    store: &StateStore,
    conditions: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = conditions
        .iter()
        .map(|(feature, value)| (feature.clone(), value.clone()))
        .collect();
    pairs.sort_by_key(|(feature, _)| store.context_feature_index(feature).unwrap_or(usize::MAX));
    pairs
}

#[derive(Debug, Deserialize)]
struct AddRuleInput {
    setting: String,
    feature_values: BTreeMap<String, String>,
    value: Value,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SearchRuleInput {
    setting: String,
    feature_values: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RuleValueInput {
    value: Value,
}
