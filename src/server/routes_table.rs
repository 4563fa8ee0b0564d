//! Table routes: the SELECT builder, table introspection, and bulk ingest.

use std::collections::HashMap;

use axum::extract::{FromRequest, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use tokio_util::io::StreamReader;

use crate::db::decode::{decode_body, BodyFormat};
use crate::db::{SelectCap, Value};
use crate::error::{ApiError, ApiResult};
use crate::state::{generate_query_id, AppState, QuerySpec};

use super::request::{Check, PathParts, ReqCtx, HEADER_CONTINUE};
use super::response::{negotiate, respond_dataset, respond_payload};
use super::routes_query::{parse_limit, run_query_request};

/// `GET /{connection}/{schema}/{table}/.columns`.
pub async fn get_table_columns(
    State(state): State<AppState>,
    Path((connection, schema, table)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, schema, table, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection, Check::Schema, Check::Table])?;
    super::routes_connection::schemata_columns(&ctx, &headers).await
}

/// `GET /{connection}/{schema}/{table}/.indexes`.
pub async fn get_table_indexes(
    State(state): State<AppState>,
    Path((connection, schema, table)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, schema, table, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection, Check::Schema, Check::Table])?;

    let handle = ctx.handle().await?;
    let data = handle
        .get_indexes(&ctx.db_table)
        .await
        .map_err(|e| ApiError::driver("could not get table indexes", e))?;
    Ok(respond_dataset(&ctx.id, negotiate(&headers), data))
}

/// `GET /{connection}/{schema}/{table}/.keys`.
pub async fn get_table_keys(
    State(state): State<AppState>,
    Path((connection, schema, table)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, schema, table, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection, Check::Schema, Check::Table])?;

    let handle = ctx.handle().await?;
    let data = handle
        .get_primary_keys(&ctx.db_table)
        .await
        .map_err(|e| ApiError::driver("could not get table keys", e))?;
    Ok(respond_dataset(&ctx.id, negotiate(&headers), data))
}

/// Query parameters with meaning to the builder itself; everything else
/// becomes an equality predicate.
const RESERVED_PARAMS: &[&str] = &["database", "schema", "id", "limit"];

/// `GET /{connection}/{schema}/{table}` — the SELECT builder.
///
/// `.columns` projects, `.limit` caps (default 100, `-1` unlimited), and any
/// other `k=v` parameter becomes a conjunctive equality predicate bound as a
/// statement parameter. The constructed query runs through the same
/// long-poll pipeline as ad-hoc SQL, but needs no SQL grant: it is scoped to
/// a table the caller already reads.
pub async fn get_table_select(
    State(state): State<AppState>,
    Path((connection, schema, table)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let mut ctx = ReqCtx::new(
        &state,
        PathParts { connection, schema, table, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection, Check::Schema, Check::Table])?;

    let kind = ctx
        .kind
        .ok_or_else(|| ApiError::not_found(format!("could not find connection {}", ctx.connection)))?;
    let limit = parse_limit(&query, ".limit", 100)?;

    let projected = match query.get(".columns") {
        None => "*".to_string(),
        Some(raw) => {
            let fields: Vec<&str> =
                raw.split(',').map(str::trim).filter(|f| !f.is_empty()).collect();
            if fields.is_empty() {
                "*".to_string()
            } else {
                fields
                    .iter()
                    .map(|f| {
                        if *f == "*" {
                            Ok("*".to_string())
                        } else {
                            safe_ident(f).map(|_| kind.quote_ident(f))
                        }
                    })
                    .collect::<ApiResult<Vec<_>>>()?
                    .join(", ")
            }
        }
    };

    // predicates bind values as parameters; only identifiers reach the text
    let mut predicates = Vec::new();
    let mut params = Vec::new();
    let mut keys: Vec<&String> = query.keys().collect();
    keys.sort();
    for key in keys {
        if key.starts_with('.') || RESERVED_PARAMS.contains(&key.as_str()) {
            continue;
        }
        safe_ident(key)?;
        predicates.push(format!("{} = ?", kind.quote_ident(key)));
        params.push(Value::Text(query[key].clone()));
    }

    let mut sql = String::from("select ");
    if limit > 0 {
        if let SelectCap::Top(n) = kind.select_cap(limit) {
            sql.push_str(&format!("top {n} "));
        }
    }
    sql.push_str(&projected);
    sql.push_str(" from ");
    sql.push_str(&ctx.db_table.quoted(kind));
    if !predicates.is_empty() {
        sql.push_str(" where ");
        sql.push_str(&predicates.join(" and "));
    }
    if limit > 0 {
        if let SelectCap::Limit(n) = kind.select_cap(limit) {
            sql.push_str(&format!(" limit {n}"));
        }
    }

    if ctx.id.is_empty() {
        ctx.id = generate_query_id();
    }
    let spec = QuerySpec {
        id: ctx.id.clone(),
        conn: ctx.connection.clone(),
        database: ctx.database.clone(),
        text: sql,
        params,
        limit,
    };
    let continued = headers.contains_key(HEADER_CONTINUE);
    run_query_request(&state, &ctx, &headers, spec, continued).await
}

/// `POST /{connection}/{schema}/{table}` — bulk insert.
pub async fn post_table_insert(
    State(state): State<AppState>,
    Path((connection, schema, table)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    request: axum::extract::Request,
) -> ApiResult<Response> {
    let headers = request.headers().clone();
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, schema, table, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection, Check::Schema, Check::Table])?;
    if !ctx.can_write(&ctx.db_table) {
        return Err(ApiError::forbidden("forbidden access for: table"));
    }
    if query.get("strategy").map(String::as_str) == Some("upsert") {
        // reserved until the handle grows a matching batch primitive
        return Err(ApiError::NotImplemented);
    }

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();

    let decoded = if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::bad_input(format!("could not read form upload: {e}")))?;
        let mut upload = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_input(format!("could not read form upload: {e}")))?
        {
            if field.name() == Some("file") || field.file_name().is_some() {
                upload = Some(field.bytes().await.map_err(|e| {
                    ApiError::bad_input(format!("could not read form upload: {e}"))
                })?);
                break;
            }
        }
        let bytes = upload.ok_or_else(|| ApiError::bad_input("could not get form file"))?;
        // sniff the upload's first bytes for its format
        let format = BodyFormat::sniff(&bytes);
        decode_body(format, std::io::Cursor::new(bytes)).await
    } else {
        let format = BodyFormat::from_content_type(&content_type);
        let stream = request
            .into_body()
            .into_data_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        decode_body(format, StreamReader::new(stream)).await
    }
    .map_err(|e| ApiError::bad_input(format!("could not decode request body: {e}")))?;

    let handle = ctx.handle().await?;
    let token = handle.root_context().child_token();
    handle
        .begin()
        .await
        .map_err(|e| ApiError::driver("could not begin transaction", e))?;
    let affected = match handle.insert_batch(token, &ctx.db_table, decoded).await {
        Ok(affected) => affected,
        Err(e) => {
            let _ = handle.rollback().await;
            return Err(ApiError::driver("could not insert into table", e));
        }
    };
    if let Err(e) = handle.commit().await {
        let _ = handle.rollback().await;
        return Err(ApiError::driver("could not commit transaction", e));
    }

    tracing::debug!(
        table = %ctx.db_table.full_name(),
        affected,
        "batch insert committed"
    );
    let payload = serde_json::json!({ "affected": affected });
    Ok(respond_payload(&ctx.id, StatusCode::OK, &payload))
}

/// `PUT /{connection}/{schema}/{table}` — upsert, reserved.
///
/// Answers before any validation on purpose: the 501 must not leak whether
/// the table exists to unauthenticated callers.
pub async fn put_table_upsert() -> ApiError {
    ApiError::NotImplemented
}

/// `PATCH /{connection}/{schema}/{table}` — update, reserved. Same
/// validation-free ordering as upsert.
pub async fn patch_table_update() -> ApiError {
    ApiError::NotImplemented
}

fn safe_ident(ident: &str) -> ApiResult<()> {
    let ok = !ident.is_empty()
        && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !ident.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true);
    if ok {
        Ok(())
    } else {
        Err(ApiError::bad_input(format!("invalid identifier: {ident}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_guard() {
        assert!(safe_ident("country").is_ok());
        assert!(safe_ident("tel_code2").is_ok());
        assert!(safe_ident("1abc").is_err());
        assert!(safe_ident("a;drop table x").is_err());
        assert!(safe_ident("\"quoted\"").is_err());
        assert!(safe_ident("").is_err());
    }
}
