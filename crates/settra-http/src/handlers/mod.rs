//! Route dispatch and the error-to-status mapping.

pub mod context_features;
pub mod metadata;
pub mod query;
pub mod rules;
pub mod settings;

use crate::http::{HttpResponse, Request};
use crate::state::{AppState, DbState};
use serde::de::DeserializeOwned;
use serde_json::json;
use settra_service::{DeclareError, FilterError, QueryError};
use settra_store::StoreError;
use tracing::error;

/// Route a parsed request to its handler.
pub fn dispatch(state: &AppState, request: &Request) -> HttpResponse {
    let segments = request.segments();
    let segment_refs: Vec<&str> = segments.iter().map(String::as_str).collect();
    match segment_refs.as_slice() {
        [] => index(),
        ["api", "health"] => health(state),
        ["api", "v1", rest @ ..] => {
            let Some(db) = state.db() else {
                return HttpResponse::error(
                    500,
                    "server is running in doc-only mode, only docs and health are enabled",
                );
            };
            dispatch_v1(db, request, rest)
        }
        _ => HttpResponse::error(404, format!("unknown route: {}", request.path)),
    }
}

fn dispatch_v1(db: &DbState, request: &Request, rest: &[&str]) -> HttpResponse {
    let method = request.method.as_str();
    match rest {
        ["query"] if method == "GET" => query::get_query(db, request),
        ["context_features", ..] => context_features::route(db, request, &rest[1..]),
        ["rules", "query"] if method == "POST" => query::post_legacy_query(db, request),
        ["rules", ..] => rules::route(db, request, &rest[1..]),
        ["settings", ..] => settings::route(db, request, &rest[1..]),
        _ => HttpResponse::error(404, format!("unknown route: {}", request.path)),
    }
}

fn index() -> HttpResponse {
    HttpResponse::json(
        200,
        json!({
            "service": "settra.v1",
            "routes": [
                "/api/health",
                "/api/v1/query",
                "/api/v1/context_features",
                "/api/v1/rules",
                "/api/v1/settings",
            ]
        }),
    )
}

fn health(state: &AppState) -> HttpResponse {
    let status = if state.healthy() { 200 } else { 500 };
    HttpResponse::json(status, json!({ "version": state.version() }))
}

/// 405 for a known path with the wrong method.
pub(crate) fn method_not_allowed(request: &Request) -> HttpResponse {
    HttpResponse::error(
        405,
        format!("method {} not allowed on {}", request.method, request.path),
    )
}

/// Parse a JSON request body, reporting undecodable bodies as 400.
pub(crate) fn json_body<T: DeserializeOwned>(request: &Request) -> Result<T, HttpResponse> {
    serde_json::from_slice(&request.body)
        .map_err(|e| HttpResponse::error(400, format!("invalid request body: {e}")))
}

/// Map store errors onto the service-wide status taxonomy.
pub(crate) fn store_error_response(err: StoreError) -> HttpResponse {
    match &err {
        StoreError::FeatureNotFound(_)
        | StoreError::SettingNotFound(_)
        | StoreError::RuleNotFound(_)
        | StoreError::UnknownFeatures(_) => HttpResponse::error(404, err.to_string()),

        StoreError::FeatureExists(_)
        | StoreError::FeatureInUse { .. }
        | StoreError::NameTaken(_)
        | StoreError::RuleExists { .. } => HttpResponse::error(409, err.to_string()),

        StoreError::TypeConflicts { conflicts, .. }
        | StoreError::FeaturesInUseByRules { conflicts } => {
            HttpResponse::json(409, json!({ "conflicts": conflicts }))
        }

        StoreError::NotConfigurable { .. } => HttpResponse::error(400, err.to_string()),

        StoreError::EmptyConditions
        | StoreError::ValueMismatch { .. }
        | StoreError::InvalidName(_)
        | StoreError::InvalidMetadataKey(_)
        | StoreError::InvalidConditionValue { .. } => HttpResponse::error(422, err.to_string()),

        StoreError::Reconcile(_) => HttpResponse::error(500, err.to_string()),
    }
}

pub(crate) fn declare_error_response(err: DeclareError) -> HttpResponse {
    match &err {
        DeclareError::AliasNotFound(_) | DeclareError::UnknownContextFeatures(_) => {
            HttpResponse::error(404, err.to_string())
        }
        DeclareError::AliasMismatch { .. } => HttpResponse::error(409, err.to_string()),
        DeclareError::AliasEqualsName(_)
        | DeclareError::MissingDefault
        | DeclareError::DefaultMismatch { .. } => HttpResponse::error(422, err.to_string()),
        DeclareError::Store(store_err) => store_error_response(store_err.clone()),
    }
}

pub(crate) fn query_error_response(err: QueryError) -> HttpResponse {
    match &err {
        QueryError::UnknownSettings(_) => HttpResponse::error(404, err.to_string()),
        QueryError::CacheTimeInFuture => HttpResponse::error(422, err.to_string()),
    }
}

pub(crate) fn filter_error_response(err: FilterError) -> HttpResponse {
    match &err {
        FilterError::Syntax(_) => HttpResponse::error(422, err.to_string()),
        FilterError::DuplicateFeature(_) => HttpResponse::error(400, err.to_string()),
    }
}

/// Persist the committed state; a failed snapshot write is fatal for the
/// request but leaves the in-memory commit in place for the next writer.
pub(crate) fn persist_or_fail(
    db: &crate::state::DbState,
    store: &settra_store::StateStore,
    response: HttpResponse,
) -> HttpResponse {
    match db.persist(store) {
        Ok(()) => response,
        Err(err) => {
            error!(error = %err, "failed to persist state snapshot");
            HttpResponse::error(500, format!("failed to persist state: {err}"))
        }
    }
}
