//! `/api/v1/context_features` handlers.

use super::{json_body, method_not_allowed, persist_or_fail, store_error_response};
use crate::http::{HttpResponse, Request};
use crate::state::DbState;
use serde::Deserialize;
use serde_json::json;
use settra_store::MoveAnchor;

pub fn route(db: &DbState, request: &Request, rest: &[&str]) -> HttpResponse {
    match (request.method.as_str(), rest) {
        ("GET", []) => {
            let store = db.read();
            HttpResponse::json(200, json!({ "context_features": store.context_features() }))
        }
        ("POST", []) => {
            let input: AddInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let mut store = db.write();
            match store.add_context_feature(&input.context_feature) {
                Ok(_) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("GET", [name]) => {
            let store = db.read();
            match store.context_feature_index(name) {
                Some(index) => HttpResponse::json(200, json!({ "index": index })),
                None => HttpResponse::error(404, format!("context feature not found: {name}")),
            }
        }
        ("DELETE", [name]) => {
            let mut store = db.write();
            match store.delete_context_feature(name) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        ("PATCH", [name, "index"]) => {
            let input: MoveInput = match json_body(request) {
                Ok(input) => input,
                Err(response) => return response,
            };
            let anchor = match (input.to_before, input.to_after) {
                (Some(target), None) => MoveAnchor::Before(target),
                (None, Some(target)) => MoveAnchor::After(target),
                _ => {
                    return HttpResponse::error(
                        422,
                        "exactly one of to_before or to_after is required",
                    );
                }
            };
            let mut store = db.write();
            match store.move_context_feature(name, anchor) {
                Ok(()) => persist_or_fail(db, &store, HttpResponse::no_content()),
                Err(err) => store_error_response(err),
            }
        }
        (_, [] | [_] | [_, "index"]) => method_not_allowed(request),
        _ => HttpResponse::error(404, format!("unknown route: {}", request.path)),
    }
}

#[derive(Debug, Deserialize)]
struct AddInput {
    context_feature: String,
}

#[derive(Debug, Deserialize)]
struct MoveInput {
    #[serde(default)]
    to_before: Option<String>,
    #[serde(default)]
    to_after: Option<String>,
}
