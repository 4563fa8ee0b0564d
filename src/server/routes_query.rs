//! SQL submission, long-poll continuation, and cancellation.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;

use crate::error::{ApiError, ApiResult};
use crate::state::{generate_query_id, AppState, QueryOutcome, QuerySpec};

use super::request::{Check, PathParts, ReqCtx, HEADER_CONTINUE};
use super::response::{negotiate, respond_payload, stream_rows, HEADER_STATUS};

/// `POST /{connection}/.sql` — submit without a caller-chosen id.
pub async fn post_connection_sql(
    State(state): State<AppState>,
    Path(connection): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    submit_sql(state, PathParts { connection, ..PathParts::default() }, query, headers, body).await
}

/// `POST /{connection}/.sql/{id}` — submit or continue a named query.
pub async fn post_connection_sql_id(
    State(state): State<AppState>,
    Path((connection, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    submit_sql(state, PathParts { connection, id, ..PathParts::default() }, query, headers, body)
        .await
}

async fn submit_sql(
    state: AppState,
    parts: PathParts,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let mut ctx = ReqCtx::new(&state, parts, &headers, &query)?;
    ctx.query_text = body;
    if ctx.id.is_empty() {
        ctx.id = generate_query_id();
    }

    ctx.validate(&[Check::Connection, Check::Query])?;
    if !ctx.can_sql() {
        return Err(ApiError::forbidden("Not allowed to submit custom SQL"));
    }

    let limit = parse_limit(&query, "limit", 0)?;
    let continued = headers.contains_key(HEADER_CONTINUE);
    let spec = QuerySpec {
        id: ctx.id.clone(),
        conn: ctx.connection.clone(),
        database: ctx.database.clone(),
        text: ctx.query_text.clone(),
        params: Vec::new(),
        limit,
    };

    run_query_request(&state, &ctx, &headers, spec, continued).await
}

/// `POST /{connection}/.cancel/{id}` — cancel an in-flight query.
pub async fn post_connection_cancel(
    State(state): State<AppState>,
    Path((connection, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, id, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection, Check::Id])?;
    if !ctx.can_sql() {
        return Err(ApiError::forbidden("Not allowed to cancel queries"));
    }

    ctx.project.queries.cancel(&ctx.id)?;
    let payload = serde_json::json!({ "id": ctx.id, "status": "cancelled" });
    Ok(respond_payload(&ctx.id, StatusCode::OK, &payload))
}

/// Shared submit/long-poll pipeline for ad-hoc SQL and built SELECTs.
///
/// Races the query's done signal against the configured window: done wins
/// and the final response streams rows or carries the terminal snapshot;
/// the window wins and the caller gets `202` plus the snapshot to continue
/// with. Freshly *generated* queries answer `202` immediately so the
/// expanded SQL is visible before results.
pub(crate) async fn run_query_request(
    state: &AppState,
    ctx: &ReqCtx,
    headers: &HeaderMap,
    spec: QuerySpec,
    continued: bool,
) -> ApiResult<Response> {
    let handle = ctx.handle().await?;
    let registry = &ctx.project.queries;
    let query = registry.submit_or_get(&ctx.project.id, handle, spec, continued)?;

    if query.is_generated && !continued {
        let snapshot = query.snapshot();
        let mut response = respond_payload(
            &query.id,
            StatusCode::ACCEPTED,
            &serde_json::to_value(&snapshot).unwrap_or_default(),
        );
        set_status_header(&mut response, snapshot.status.as_str());
        return Ok(response);
    }

    let window = state.config().long_poll_window;
    if !query.wait_done(window).await {
        let snapshot = query.snapshot();
        let mut response = respond_payload(
            &query.id,
            StatusCode::ACCEPTED,
            &serde_json::to_value(&snapshot).unwrap_or_default(),
        );
        set_status_header(&mut response, snapshot.status.as_str());
        return Ok(response);
    }

    let status = query.status();
    match query.finish(registry) {
        QueryOutcome::Rows(rows) => {
            let mut response = stream_rows(&query.id, negotiate(headers), rows).await;
            set_status_header(&mut response, status.as_str());
            Ok(response)
        }
        QueryOutcome::Affected(_) => {
            let snapshot = query.snapshot();
            let mut response = respond_payload(
                &query.id,
                StatusCode::OK,
                &serde_json::to_value(&snapshot).unwrap_or_default(),
            );
            set_status_header(&mut response, snapshot.status.as_str());
            Ok(response)
        }
        QueryOutcome::Failed(message) => {
            // the HTTP request succeeded; the query did not
            let snapshot = query.snapshot();
            let mut payload = serde_json::to_value(&snapshot).unwrap_or_default();
            if let Some(object) = payload.as_object_mut() {
                object.insert("error".to_string(), serde_json::Value::from(message));
            }
            let mut response = respond_payload(&query.id, StatusCode::OK, &payload);
            set_status_header(&mut response, snapshot.status.as_str());
            Ok(response)
        }
    }
}

fn set_status_header(response: &mut Response, status: &str) {
    if let Ok(value) = status.parse() {
        response.headers_mut().insert(HEADER_STATUS, value);
    }
}

/// Parse a row-limit query parameter.
///
/// `0` (or absence) takes the route default, `-1` means unlimited, and any
/// other negative value is invalid.
pub(crate) fn parse_limit(
    query: &HashMap<String, String>,
    key: &str,
    default: i64,
) -> ApiResult<i64> {
    let Some(raw) = query.get(key) else { return Ok(default) };
    let value: i64 = raw
        .parse()
        .map_err(|_| ApiError::bad_input(format!("invalid {key} value: {raw}")))?;
    match value {
        0 => Ok(default),
        -1 => Ok(-1),
        v if v < -1 => Err(ApiError::bad_input(format!("invalid {key} value: {raw}"))),
        v => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_boundaries() {
        let with = |v: &str| {
            let mut q = HashMap::new();
            q.insert("limit".to_string(), v.to_string());
            q
        };

        assert_eq!(parse_limit(&HashMap::new(), "limit", 100).unwrap(), 100);
        assert_eq!(parse_limit(&with("0"), "limit", 100).unwrap(), 100);
        assert_eq!(parse_limit(&with("-1"), "limit", 100).unwrap(), -1);
        assert_eq!(parse_limit(&with("25"), "limit", 100).unwrap(), 25);
        assert!(parse_limit(&with("-2"), "limit", 100).is_err());
        assert!(parse_limit(&with("abc"), "limit", 100).is_err());
    }
}
