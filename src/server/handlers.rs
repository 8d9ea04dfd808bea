//! HTTP handlers: insert, query, health, and the SSE subscription stream.

use std::convert::Infallible;
use std::sync::LazyLock;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use regex::Regex;
use serde_json::{json, Value};

use super::AppState;
use crate::error::{Error, Result};
use crate::store::{LogRecord, QueryFilter, QueryOperator};

/// One comparison per match: operator then value, comma-separated within a
/// single query-string parameter.
static FILTER_EXPR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(>=|<=|!=|~=|=|>|<)([^,]+)").expect("filter regex is valid"));

fn bad_request(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

/// Parse one `field=EXPR` query parameter into query filters.
pub(crate) fn parse_filter_expr(field: &str, expr: &str) -> Result<Vec<QueryFilter>> {
    let mut filters = Vec::new();
    for captures in FILTER_EXPR.captures_iter(expr) {
        let operator: QueryOperator = captures[1].parse()?;
        filters.push(QueryFilter {
            field: field.to_string(),
            operator,
            value: Value::String(captures[2].trim().to_string()),
        });
    }
    if filters.is_empty() {
        return Err(Error::Validation(format!(
            "field '{field}' has invalid filter expression: {expr}"
        )));
    }
    Ok(filters)
}

fn parse_payload(body: &[u8]) -> Result<Vec<LogRecord>> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| Error::Validation(format!("malformed json: {e}")))?;
    match value {
        Value::Object(record) => Ok(vec![record]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(record) => Ok(record),
                _ => Err(Error::Validation(
                    "array items must be json objects".to_string(),
                )),
            })
            .collect(),
        _ => Err(Error::Validation(
            "request body must be a json object or array".to_string(),
        )),
    }
}

/// POST /logs: insert one record or a batch.
pub async fn insert_logs(State(state): State<AppState>, body: Bytes) -> Response {
    let records = match parse_payload(&body) {
        Ok(records) => records,
        Err(e) => return bad_request(e),
    };
    match state.store.insert(&records).await {
        Ok(_) => {
            let id = state.store.get_max_log_id().await.unwrap_or(0);
            Json(json!({ "id": id, "status": "success" })).into_response()
        }
        Err(e) => {
            tracing::error!("error inserting logs: {e}");
            internal_error(e)
        }
    }
}

/// GET /logs: filtered, paginated query. `fields`, `offset` and `limit`
/// are reserved; every other parameter is a filter expression on that field.
pub async fn query_logs(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let mut fields = vec!["*".to_string()];
    let mut offset = 0u64;
    let mut limit = 100u64;
    let mut filters = Vec::new();

    for (key, value) in &params {
        match key.as_str() {
            "fields" => {
                fields = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "offset" => match value.parse() {
                Ok(v) => offset = v,
                Err(_) => return bad_request(format!("invalid offset: {value}")),
            },
            "limit" => match value.parse() {
                Ok(v) => limit = v,
                Err(_) => return bad_request(format!("invalid limit: {value}")),
            },
            field => match parse_filter_expr(field, value) {
                Ok(parsed) => filters.extend(parsed),
                Err(e) => return bad_request(e),
            },
        }
    }

    match state.store.query(&fields, &filters, limit, offset).await {
        Ok(result) => Json(result).into_response(),
        Err(Error::Validation(e)) => bad_request(e),
        Err(e) => {
            tracing::error!("error querying logs: {e}");
            internal_error(e)
        }
    }
}

/// GET /health: true iff a trivial store round-trip succeeds.
pub async fn health(State(state): State<AppState>) -> Response {
    if state.store.ping().await {
        Json(json!(true)).into_response()
    } else {
        internal_error("database unreachable")
    }
}

/// GET /logs/stream: server-sent events. Each subscriber debounces its own
/// frames: at most one frame per debounce window, containing the records
/// inserted since the last push. Dropping the response stream unsubscribes.
pub async fn stream_logs(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let mut rx = state.notifier.subscribe();
    let mut pushed = state.notifier.get().unwrap_or(0);
    let debounce = state.sse_debounce;
    let limit = state.sse_limit;
    let store = state.store.clone();

    let stream = async_stream::stream! {
        let mut last_push: Option<Instant> = None;
        loop {
            match tokio::time::timeout(debounce, rx.changed()).await {
                // Notifier dropped: the service is shutting down.
                Ok(Err(_)) => break,
                Ok(Ok(())) | Err(_) => {}
            }
            if last_push.is_some_and(|at| at.elapsed() < debounce) {
                continue;
            }
            let current = *rx.borrow_and_update();
            let latest = match current {
                Some(id) => id,
                None => continue,
            };
            if latest <= pushed {
                continue;
            }

            // Catch up oldest-first in a contiguous run from the cursor;
            // records beyond the limit stay above `pushed` for the next
            // frame instead of being skipped.
            let records = match store.query_after_id(pushed, limit).await {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!("sse query failed: {e}");
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }
            let frame_max = records
                .iter()
                .filter_map(|r| r.get("id").and_then(Value::as_i64))
                .max()
                .unwrap_or(latest);
            match serde_json::to_string(&records) {
                Ok(data) => {
                    yield Ok(Event::default().data(data));
                    pushed = frame_max;
                    last_push = Some(Instant::now());
                }
                Err(e) => tracing::warn!("sse serialization failed: {e}"),
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
