//! Metadata sub-endpoints shared by rules and settings.
//!
//! POST merges, PUT replaces (an empty body clears), DELETE clears, and the
//! per-key variants set or remove one entry.

use super::{json_body, method_not_allowed, persist_or_fail, store_error_response};
use crate::http::{HttpResponse, Request};
use crate::state::DbState;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct MetadataInput {
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct MetadataKeyInput {
    value: Value,
}

pub fn route_setting_metadata(
    db: &DbState,
    request: &Request,
    name: &str,
    rest: &[&str],
) -> HttpResponse {
    match (request.method.as_str(), rest) {
        ("GET", []) => {
            let store = db.read();
            match store.setting(name) {
                Some(record) => HttpResponse::json(200, json!({ "metadata": record.metadata })),
                None => HttpResponse::error(404, format!("setting not found: {name}")),
            }
        }
        ("POST", []) => {
            let input: MetadataInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let mut store = db.write();
            if store.setting(name).is_none() {
                return HttpResponse::error(404, format!("setting not found: {name}"));
            }
            if input.metadata.is_empty() {
                return HttpResponse::no_content();
            }
            match store.update_setting_metadata(name, input.metadata) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("PUT", []) => {
            let input: MetadataInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let mut store = db.write();
            match store.replace_setting_metadata(name, input.metadata) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("DELETE", []) => {
            let mut store = db.write();
            match store.replace_setting_metadata(name, BTreeMap::new()) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("PUT", [key]) => {
            let input: MetadataKeyInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let mut store = db.write();
            match store.put_setting_metadata_key(name, key, input.value) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("GET", [key]) => {
            let store = db.read();
            match store.setting(name) {
                Some(record) => match record.metadata.get(*key) {
                    Some(value) => HttpResponse::json(200, json!({ "value": value })),
                    None => HttpResponse::error(404, format!("metadata key not found: {key}")),
                },
                None => HttpResponse::error(404, format!("setting not found: {name}")),
            }
        }
        ("DELETE", [key]) => {
            let mut store = db.write();
            match store.delete_setting_metadata_key(name, key) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        (_, [] | [_]) => method_not_allowed(request),
        _ => HttpResponse::error(404, format!("unknown route: {}", request.path)),
    }
}

pub fn route_rule_metadata(
    db: &DbState,
    request: &Request,
    rule_id: u64,
    rest: &[&str],
) -> HttpResponse {
    match (request.method.as_str(), rest) {
        ("GET", []) => {
            let store = db.read();
            match store.rule(rule_id) {
                Some(rule) => HttpResponse::json(200, json!({ "metadata": rule.metadata })),
                None => HttpResponse::error(404, format!("rule not found: {rule_id}")),
            }
        }
        ("POST", []) => {
            let input: MetadataInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let mut store = db.write();
            if store.rule(rule_id).is_none() {
                return HttpResponse::error(404, format!("rule not found: {rule_id}"));
            }
            if input.metadata.is_empty() {
                return HttpResponse::no_content();
            }
            match store.update_rule_metadata(rule_id, input.metadata) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("PUT", []) => {
            let input: MetadataInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let mut store = db.write();
            match store.replace_rule_metadata(rule_id, input.metadata) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("DELETE", []) => {
            let mut store = db.write();
            match store.replace_rule_metadata(rule_id, BTreeMap::new()) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("PUT", [key]) => {
            let input: MetadataKeyInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let mut store = db.write();
            match store.put_rule_metadata_key(rule_id, key, input.value) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("GET", [key]) => {
            let store = db.read();
            match store.rule(rule_id) {
                Some(rule) => match rule.metadata.get(*key) {
                    Some(value) => HttpResponse::json(200, json!({ "value": value })),
                    None => HttpResponse::error(404, format!("metadata key not found: {key}")),
                },
                None => HttpResponse::error(404, format!("rule not found: {rule_id}")),
            }
        }
        ("DELETE", [key]) => {
            let mut store = db.write();
            match store.delete_rule_metadata_key(rule_id, key) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        (_, [] | [_]) => method_not_allowed(request),
        _ => HttpResponse::error(404, format!("unknown route: {}", request.path)),
    }
}
