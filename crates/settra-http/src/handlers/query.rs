//! Query handlers: the ETag-based `GET /api/v1/query` and the deprecated
//! body-based `POST /api/v1/rules/query`.

use super::{filter_error_response, json_body, query_error_response};
use crate::http::{HttpResponse, Request};
use crate::state::DbState;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use settra_service::{
    ContextFilter, FeatureFilter, QueryRequest, query_rules, query_rules_since, state_etag,
};
use std::collections::{BTreeMap, BTreeSet};

/// `GET /api/v1/query?settings=&context_filters=&include_metadata=`
pub fn get_query(db: &DbState, request: &Request) -> HttpResponse {
    // an empty `settings=` parameter means no setting filter at all
    let settings = request
        .query
        .get("settings")
        .filter(|raw| !raw.is_empty())
        .map(|raw| raw.split(',').map(str::to_string).collect::<Vec<String>>());
    let raw_filters = request
        .query
        .get("context_filters")
        .map(String::as_str)
        .unwrap_or("*");
    let filter = match ContextFilter::parse(raw_filters) {
        Ok(filter) => filter,
        Err(err) => return filter_error_response(err),
    };
    let include_metadata = request
        .query
        .get("include_metadata")
        .is_some_and(|value| value == "true");

    let store = db.read();
    let output = match query_rules(
        &store,
        QueryRequest {
            settings,
            filter,
            include_metadata,
        },
    ) {
        Ok(output) => output,
        Err(err) => return query_error_response(err),
    };

    let etag = state_etag(&store);
    if let Some(if_none_match) = request.header("if-none-match")
        && (if_none_match == "*" || if_none_match.contains(&etag))
    {
        return HttpResponse {
            status: 304,
            body: None,
            headers: vec![("ETag".to_string(), etag)],
        };
    }
    let body = serde_json::to_value(&output).expect("query output always serializes");
    HttpResponse::json(200, body).with_header("ETag", etag)
}

#[derive(Debug, Deserialize)]
struct LegacyQueryBody {
    setting_names: Vec<String>,
    context_features_options: LegacyOptions,
    #[serde(default)]
    cache_time: Option<NaiveDateTime>,
    #[serde(default)]
    include_metadata: bool,
}

/// The body-based filter form: `"*"` or a map of feature to `"*"`/values.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyOptions {
    Wildcard(String),
    PerFeature(BTreeMap<String, LegacyFeatureOptions>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyFeatureOptions {
    Wildcard(String),
    Values(Vec<String>),
}

impl LegacyOptions {
    fn into_filter(self) -> Result<ContextFilter, HttpResponse> {
        match self {
            Self::Wildcard(token) if token == "*" => Ok(ContextFilter::All),
            Self::Wildcard(token) => Err(HttpResponse::error(
                422,
                format!("expected '*' or a filter mapping, got {token:?}"),
            )),
            Self::PerFeature(entries) => {
                let mut filters = BTreeMap::new();
                for (feature, options) in entries {
                    let filter = match options {
                        LegacyFeatureOptions::Wildcard(token) if token == "*" => FeatureFilter::Any,
                        LegacyFeatureOptions::Wildcard(token) => {
                            return Err(HttpResponse::error(
                                422,
                                format!("expected '*' or a value list for {feature}, got {token:?}"),
                            ));
                        }
                        LegacyFeatureOptions::Values(values) if values.is_empty() => {
                            return Err(HttpResponse::error(422, "cannot accept an empty option"));
                        }
                        LegacyFeatureOptions::Values(values) => {
                            FeatureFilter::Values(values.into_iter().collect::<BTreeSet<String>>())
                        }
                    };
                    filters.insert(feature, filter);
                }
                Ok(ContextFilter::Features(filters))
            }
        }
    }
}

/// `POST /api/v1/rules/query` — deprecated; kept for clients still sending
/// `cache_time`. Unlike the ETag endpoint, unknown filter features are an
/// error here.
pub fn post_legacy_query(db: &DbState, request: &Request) -> HttpResponse {
    let body: LegacyQueryBody = match json_body(request) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let filter = match body.context_features_options.into_filter() {
        Ok(filter) => filter,
        Err(response) => return response,
    };

    let store = db.read();
    if let ContextFilter::Features(filters) = &filter {
        let unknown = store.unknown_context_features(filters.keys());
        if !unknown.is_empty() {
            return HttpResponse::error(
                404,
                format!("the following are not valid context features: {unknown:?}"),
            );
        }
    }
    let cache_time = body
        .cache_time
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    match query_rules_since(
        &store,
        &body.setting_names,
        filter,
        cache_time,
        body.include_metadata,
    ) {
        Ok(results) => {
            let body = serde_json::to_value(&results).expect("query output always serializes");
            HttpResponse::json(200, json!({ "rules": body }))
        }
        Err(err) => query_error_response(err),
    }
}
