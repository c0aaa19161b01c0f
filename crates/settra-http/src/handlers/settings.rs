//! `/api/v1/settings` handlers.

use super::{
    declare_error_response, json_body, metadata, method_not_allowed, persist_or_fail,
    store_error_response,
};
use crate::http::{HttpResponse, Request};
use crate::state::DbState;
use serde::Deserialize;
use serde_json::{Value, json};
use settra_service::{DeclarationInput, declare};
use settra_store::{SettingRecord, SettingUpdate, StateStore};
use settra_types::{SettingVersion, ValueType};
use std::collections::{BTreeMap, BTreeSet};

pub fn route(db: &DbState, request: &Request, rest: &[&str]) -> HttpResponse {
    match (request.method.as_str(), rest) {
        ("GET", []) => {
            let include_additional_data = request
                .query
                .get("include_additional_data")
                .is_some_and(|value| value == "true");
            let store = db.read();
            list_settings(&store, include_additional_data)
        }
        ("POST", ["declare"]) => {
            let input: DeclareBody = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let input = match input.into_declaration() {
                Ok(input) => input,
                Err(response) => return response,
            };
            let mut store = db.write();
            match declare(&mut store, input) {
                Ok(outcome) => {
                    let status = if outcome.is_conflict() { 409 } else { 200 };
                    let body = serde_json::to_value(&outcome)
                        .expect("declaration outcomes always serialize");
                    persist_or_fail(db, &store, HttpResponse::json(status, body))
                }
                Err(err) => declare_error_response(err),
            }
        }
        ("GET", [name]) => {
            let store = db.read();
            match store.setting(name) {
                Some(record) => HttpResponse::json(200, shape_setting(&store, record)),
                None => HttpResponse::error(404, format!("setting not found: {name}")),
            }
        }
        ("DELETE", [name]) => {
            let mut store = db.write();
            match store.delete_setting(name) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("PUT", [name, "type"]) => {
            let input: PutTypeInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let value_type = match ValueType::parse(&input.type_text) {
                Ok(value_type) => value_type,
                Err(err) => return HttpResponse::error(422, err.to_string()),
            };
            let version = match parse_version(input.version.as_deref()) {
                Ok(version) => version,
                Err(response) => return response,
            };
            let mut store = db.write();
            let update = SettingUpdate {
                value_type: Some(value_type),
                version,
                ..SettingUpdate::default()
            };
            match store.update_setting(name, update) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("PUT", [name, "name"]) => {
            let input: PutNameInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let version = match parse_version(input.version.as_deref()) {
                Ok(version) => version,
                Err(response) => return response,
            };
            let mut store = db.write();
            let update = SettingUpdate {
                rename: Some(input.name),
                version,
                ..SettingUpdate::default()
            };
            match store.update_setting(name, update) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("PUT", [name, "configurable_features"]) => {
            let input: PutFeaturesInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let version = match parse_version(input.version.as_deref()) {
                Ok(version) => version,
                Err(response) => return response,
            };
            let features: BTreeSet<String> = input.configurable_features.into_iter().collect();
            let mut store = db.write();
            let update = SettingUpdate {
                configurable_features: Some(features),
                version,
                ..SettingUpdate::default()
            };
            match store.update_setting(name, update) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        (_, [name, "metadata", key_rest @ ..]) => {
            metadata::route_setting_metadata(db, request, name, key_rest)
        }
        (_, [] | ["declare"] | [_] | [_, "type"] | [_, "name"] | [_, "configurable_features"]) => {
            method_not_allowed(request)
        }
        _ => HttpResponse::error(404, format!("unknown route: {}", request.path)),
    }
}

fn list_settings(store: &StateStore, include_additional_data: bool) -> HttpResponse {
    let settings: Vec<Value> = store
        .settings()
        .map(|record| {
            if include_additional_data {
                shape_setting(store, record)
            } else {
                json!({ "name": record.name })
            }
        })
        .collect();
    HttpResponse::json(200, json!({ "settings": settings }))
}

fn shape_setting(store: &StateStore, record: &SettingRecord) -> Value {
    let mut features: Vec<&String> = record.configurable_features.iter().collect();
    features.sort_by_key(|feature| store.context_feature_index(feature).unwrap_or(usize::MAX));
    json!({
        "name": record.name,
        "configurable_features": features,
        "type": record.value_type.to_string(),
        "default_value": record.default_value,
        "metadata": record.metadata,
        "aliases": record.aliases,
        "version": record.version,
    })
}

fn parse_version(raw: Option<&str>) -> Result<Option<SettingVersion>, HttpResponse> {
    match raw {
        None => Ok(None),
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| HttpResponse::error(422, format!("invalid version {text:?}"))),
    }
}

#[derive(Debug, Deserialize)]
struct DeclareBody {
    name: String,
    configurable_features: Vec<String>,
    #[serde(rename = "type")]
    type_text: String,
    #[serde(default)]
    default_value: Option<Value>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

impl DeclareBody {
    fn into_declaration(self) -> Result<DeclarationInput, HttpResponse> {
        let value_type = ValueType::parse(&self.type_text)
            .map_err(|err| HttpResponse::error(422, err.to_string()))?;
        let version = match self.version {
            None => SettingVersion::INITIAL,
            Some(text) => text
                .parse()
                .map_err(|_| HttpResponse::error(422, format!("invalid version {text:?}")))?,
        };
        Ok(DeclarationInput {
            name: self.name,
            configurable_features: self.configurable_features,
            value_type,
            default_value: self.default_value,
            metadata: self.metadata,
            alias: self.alias,
            version,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PutTypeInput {
    #[serde(rename = "type")]
    type_text: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutNameInput {
    name: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutFeaturesInput {
    configurable_features: Vec<String>,
    #[serde(default)]
    version: Option<String>,
}
