//! Liveness, connection listing, pooled-handle close, and metadata
//! introspection routes.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;

use crate::db::{Column, Dataset, SchemataLevel, TableRef, Value};
use crate::error::ApiResult;
use crate::state::AppState;

use super::request::{Check, PathParts, ReqCtx};
use super::response::{negotiate, respond_dataset, respond_payload};

/// `GET /.status` — liveness.
pub async fn get_status() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// `GET /.connections` — the connections this caller may see.
pub async fn get_connections(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(&state, PathParts::default(), &headers, &query)?;
    ctx.validate(&[])?;

    ctx.project.load_connections(true).ok();

    let mut data = Dataset::new(vec![
        Column::text("name"),
        Column::text("type"),
        Column::text("database"),
    ]);
    for descriptor in ctx.project.list_connections() {
        if !ctx.roles.has_access(&descriptor.name) {
            continue;
        }
        data.push(vec![
            Value::Text(descriptor.name.clone()),
            Value::Text(descriptor.kind.name().to_string()),
            Value::Text(descriptor.database().unwrap_or_default().to_string()),
        ]);
    }
    data.sort_by_columns(&[0]);

    Ok(respond_dataset(&ctx.id, negotiate(&headers), data))
}

/// `POST /{connection}/.close` — evict the pooled handle.
pub async fn post_connection_close(
    State(state): State<AppState>,
    Path(connection): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection])?;

    let closed = ctx.project.connections.close_connection(&ctx.connection).await;
    let payload = serde_json::json!({ "connection": ctx.connection, "closed": closed });
    Ok(respond_payload(&ctx.id, StatusCode::OK, &payload))
}

/// `GET /{connection}/.databases`.
pub async fn get_connection_databases(
    State(state): State<AppState>,
    Path(connection): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection])?;

    let handle = ctx.handle().await?;
    let mut data = handle
        .get_databases()
        .await
        .map_err(|e| crate::error::ApiError::driver("could not get databases", e))?;
    data.sort_by_columns(&[0]);
    Ok(respond_dataset(&ctx.id, negotiate(&headers), data))
}

/// `GET /{connection}/.schemas` — schemas the caller can touch.
pub async fn get_connection_schemas(
    State(state): State<AppState>,
    Path(connection): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection])?;

    let handle = ctx.handle().await?;
    let schemata = handle
        .get_schemata(SchemataLevel::Schema, "", "")
        .await
        .map_err(|e| crate::error::ApiError::driver("could not get schemas", e))?;

    let mut data = Dataset::new(vec![Column::text("schema_name")]);
    for schema in schemata.schemas {
        let all = TableRef::schema_all(&schema);
        if ctx.can_read(&all) || ctx.can_write(&all) {
            data.push(vec![Value::Text(schema)]);
        }
    }
    data.sort_by_columns(&[0]);
    Ok(respond_dataset(&ctx.id, negotiate(&headers), data))
}

/// `GET /{connection}/.tables`.
pub async fn get_connection_tables(
    State(state): State<AppState>,
    Path(connection): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection])?;
    schemata_tables(&ctx, &headers).await
}

/// `GET /{connection}/.columns`.
pub async fn get_connection_columns(
    State(state): State<AppState>,
    Path(connection): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection])?;
    schemata_columns(&ctx, &headers).await
}

/// `GET /{connection}/{schema}/.tables`.
pub async fn get_schema_tables(
    State(state): State<AppState>,
    Path((connection, schema)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, schema, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection, Check::Schema])?;
    schemata_tables(&ctx, &headers).await
}

/// `GET /{connection}/{schema}/.columns`.
pub async fn get_schema_columns(
    State(state): State<AppState>,
    Path((connection, schema)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = ReqCtx::new(
        &state,
        PathParts { connection, schema, ..PathParts::default() },
        &headers,
        &query,
    )?;
    ctx.validate(&[Check::Connection, Check::Schema])?;
    schemata_columns(&ctx, &headers).await
}

/// Table listing filtered by the caller's permissions.
pub(crate) async fn schemata_tables(ctx: &ReqCtx, headers: &HeaderMap) -> ApiResult<Response> {
    let handle = ctx.handle().await?;
    let schemata = handle
        .get_schemata(SchemataLevel::Table, &ctx.schema, "")
        .await
        .map_err(|e| crate::error::ApiError::driver("could not get tables", e))?;

    let mut data = Dataset::new(vec![
        Column::text("database_name"),
        Column::text("schema_name"),
        Column::text("table_name"),
        Column::text("table_type"),
    ]);
    for table in &schemata.tables {
        let table_ref = table.table_ref();
        if !(ctx.can_read(&table_ref) || ctx.can_write(&table_ref)) {
            continue;
        }
        data.push(vec![
            Value::Text(table.database.clone()),
            Value::Text(table.schema.clone()),
            Value::Text(table.name.clone()),
            Value::Text(if table.is_view { "view" } else { "table" }.to_string()),
        ]);
    }
    data.sort_by_columns(&[0, 1, 2]);
    Ok(respond_dataset(&ctx.id, negotiate(headers), data))
}

/// Column listing filtered by the caller's permissions.
pub(crate) async fn schemata_columns(ctx: &ReqCtx, headers: &HeaderMap) -> ApiResult<Response> {
    let handle = ctx.handle().await?;
    let schemata = handle
        .get_schemata(SchemataLevel::Column, &ctx.schema, &ctx.table)
        .await
        .map_err(|e| crate::error::ApiError::driver("could not get columns", e))?;

    let mut data = Dataset::new(vec![
        Column::text("database_name"),
        Column::text("schema_name"),
        Column::text("table_name"),
        Column::text("table_type"),
        Column::integer("column_id"),
        Column::text("column_name"),
        Column::text("column_type"),
    ]);
    for table in &schemata.tables {
        let table_ref = table.table_ref();
        if !(ctx.can_read(&table_ref) || ctx.can_write(&table_ref)) {
            continue;
        }
        for column in &table.columns {
            data.push(vec![
                Value::Text(table.database.clone()),
                Value::Text(table.schema.clone()),
                Value::Text(table.name.clone()),
                Value::Text(if table.is_view { "view" } else { "table" }.to_string()),
                Value::Int(column.position),
                Value::Text(column.name.clone()),
                Value::Text(column.db_type.clone()),
            ]);
        }
    }
    data.sort_by_columns(&[0, 1, 2, 4]);
    Ok(respond_dataset(&ctx.id, negotiate(headers), data))
}
