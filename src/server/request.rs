//! Per-request context: authentication, permission resolution, and
//! validation.
//!
//! Every handler builds a [`ReqCtx`] first. It resolves the project from
//! `X-Project-ID`, parses `schema.table` through the connection's dialect,
//! authenticates the `Authorization` header against the token store, and
//! flattens the caller's roles into per-table permissions for this
//! connection.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;

use crate::auth::{allow_all_role_map, Permission, Permissions, RoleMap};
use crate::db::{DatabaseClient, DriverKind, TableRef};
use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, Project, DEFAULT_PROJECT_ID};

/// Request header selecting the project.
pub const HEADER_PROJECT_ID: &str = "X-Project-ID";
/// Request header marking a long-poll continuation.
pub const HEADER_CONTINUE: &str = "X-Request-Continue";

/// Path/query fields a handler may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// The query id.
    Id,
    /// The connection name, including access through the caller's roles.
    Connection,
    /// The schema name.
    Schema,
    /// The table name, including read-or-write permission.
    Table,
    /// The SQL text.
    Query,
}

/// Raw path parameters, as each route extracted them.
#[derive(Debug, Default, Clone)]
pub struct PathParts {
    /// `:connection`.
    pub connection: String,
    /// `:schema`.
    pub schema: String,
    /// `:table`.
    pub table: String,
    /// `:id`.
    pub id: String,
}

/// The resolved context for one HTTP request.
pub struct ReqCtx {
    /// Query id, from the path or the `id` query parameter.
    pub id: String,
    /// Lowercased connection name.
    pub connection: String,
    /// Database override from the `database` query parameter.
    pub database: String,
    /// Schema, canonicalised by the dialect parser.
    pub schema: String,
    /// Table, canonicalised by the dialect parser.
    pub table: String,
    /// Parsed table reference for permission checks.
    pub db_table: TableRef,
    /// Dialect of the connection, when the descriptor resolved.
    pub kind: Option<DriverKind>,
    /// The owning project.
    pub project: Arc<Project>,
    /// Roles resolved for the caller.
    pub roles: RoleMap,
    /// Flattened permissions for this connection.
    pub permissions: Permissions,
    /// SQL text carried by the request body, for the SQL route.
    pub query_text: String,
}

impl ReqCtx {
    /// Build the context from the request surface.
    pub fn new(
        state: &AppState,
        parts: PathParts,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> ApiResult<ReqCtx> {
        let id = non_empty(parts.id, query.get("id"));
        let schema = non_empty(parts.schema, query.get("schema"));
        let connection = parts.connection.to_lowercase();
        let database = query.get("database").cloned().unwrap_or_default();

        let project_id = header_value(headers, HEADER_PROJECT_ID)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string());
        let project = state
            .project(&project_id)
            .map_err(|e| ApiError::internal(e.to_string()))?
            .ok_or_else(|| ApiError::bad_input("missing request value for: project"))?;

        // parse table identifiers through the connection's dialect; an
        // unknown connection leaves the raw values in place and fails later
        // checks instead
        let kind = project.get_conn_object(&connection, "").ok().map(|d| d.kind);
        let parse_kind = kind.unwrap_or(DriverKind::Sqlite);
        let (schema, table, db_table) = if !schema.is_empty() && !parts.table.is_empty() {
            let parsed = TableRef::parse(&format!("{}.{}", schema, parts.table), parse_kind);
            (parsed.schema.clone(), parsed.name.clone(), parsed)
        } else if !schema.is_empty() {
            let parsed = TableRef::parse(&format!("{schema}.*"), parse_kind);
            (parsed.schema.clone(), String::new(), TableRef::default())
        } else {
            (schema, parts.table, TableRef::default())
        };

        let mut ctx = ReqCtx {
            id,
            connection,
            database,
            schema,
            table,
            db_table,
            kind,
            project,
            roles: RoleMap::default(),
            permissions: Permissions::new(),
            query_text: String::new(),
        };
        ctx.resolve_caller(headers);
        Ok(ctx)
    }

    /// Resolve roles and permissions for the caller.
    fn resolve_caller(&mut self, headers: &HeaderMap) {
        if self.project.no_restriction {
            self.roles = allow_all_role_map();
            self.permissions.insert("*".to_string(), Permission::ReadWrite);
            return;
        }

        let Some(raw_token) = header_value(headers, "Authorization") else { return };
        if raw_token.is_empty() {
            return;
        }

        // whole-string, case-sensitive equality; no scheme prefix
        if let Some(token) = self.project.resolve_token(&raw_token) {
            if !token.disabled {
                self.roles = self.project.get_role_map(&token.roles);
                let kind = self.kind.unwrap_or(DriverKind::Sqlite);
                self.permissions = self.roles.get_permissions(&self.connection, kind);
            }
        }
    }

    /// Enforce field presence and authorization for this request.
    pub fn validate(&self, checks: &[Check]) -> ApiResult<()> {
        let mut missing = Vec::new();
        for check in checks {
            match check {
                Check::Id if self.id.is_empty() => missing.push("id"),
                Check::Connection if self.connection.is_empty() => missing.push("connection"),
                Check::Schema if self.schema.is_empty() => missing.push("schema"),
                Check::Table if self.table.is_empty() => missing.push("table"),
                Check::Query if self.query_text.is_empty() => missing.push("query"),
                _ => {}
            }
        }
        if !missing.is_empty() {
            return Err(ApiError::bad_input(format!(
                "missing request value for: {}",
                missing.join(", ")
            )));
        }

        if self.roles.is_empty() {
            return Err(ApiError::forbidden("Invalid token or forbidden"));
        }

        for check in checks {
            match check {
                Check::Connection => {
                    if !self.roles.has_access(&self.connection) {
                        return Err(ApiError::forbidden("forbidden access for: connection"));
                    }
                }
                Check::Table => {
                    if !(self.can_read(&self.db_table) || self.can_write(&self.db_table)) {
                        return Err(ApiError::forbidden("forbidden access for: table"));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether the caller may read `table`, probing `*`, `schema.*`, then
    /// the exact name.
    pub fn can_read(&self, table: &TableRef) -> bool {
        self.permission_allows(table, Permission::can_read)
    }

    /// Whether the caller may write `table`.
    pub fn can_write(&self, table: &TableRef) -> bool {
        self.permission_allows(table, Permission::can_write)
    }

    /// Whether the caller may submit ad-hoc SQL on this connection.
    pub fn can_sql(&self) -> bool {
        self.roles.can_sql(&self.connection)
    }

    fn permission_allows(&self, table: &TableRef, allows: impl Fn(&Permission) -> bool) -> bool {
        let keys = [
            "*".to_string(),
            TableRef::schema_all(&table.schema).full_name(),
            table.full_name(),
        ];
        keys.iter().any(|key| self.permissions.get(key).map(&allows).unwrap_or(false))
    }

    /// A live handle for this request's connection.
    pub async fn handle(&self) -> ApiResult<Arc<dyn DatabaseClient>> {
        self.project
            .get_conn_instance(&self.connection, &self.database)
            .await
            .map_err(ApiError::from)
    }
}

fn non_empty(primary: String, fallback: Option<&String>) -> String {
    if primary.is_empty() {
        fallback.cloned().unwrap_or_default()
    } else {
        primary
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::state::new_token;

    fn state_with_project(dir: &std::path::Path, no_restriction: bool) -> (AppState, String) {
        std::fs::write(dir.join("env.yaml"), "sqlite_test:\n  url: \"sqlite://:memory:\"\n").unwrap();
        std::fs::write(
            dir.join("roles.yaml"),
            "role_r:\n  sqlite_test:\n    allow_read: [\"main.place\"]\n",
        )
        .unwrap();

        let config = ServerConfig {
            home_dir: dir.to_path_buf(),
            no_restriction,
            ..ServerConfig::default()
        };
        let state = AppState::new(config);
        let project = state.project(DEFAULT_PROJECT_ID).unwrap().unwrap();

        let token = new_token(vec!["role_r".to_string()]);
        let secret = token.token.clone();
        project.token_add("t", token).unwrap();
        (state, secret)
    }

    fn parts(connection: &str, schema: &str, table: &str) -> PathParts {
        PathParts {
            connection: connection.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            id: String::new(),
        }
    }

    #[test]
    fn authenticated_caller_gets_scoped_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let (state, secret) = state_with_project(dir.path(), false);

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", secret.parse().unwrap());

        let ctx = ReqCtx::new(
            &state,
            parts("SQLITE_TEST", "main", "place"),
            &headers,
            &HashMap::new(),
        )
        .expect("ctx");

        assert_eq!(ctx.connection, "sqlite_test");
        assert!(ctx.can_read(&ctx.db_table));
        assert!(!ctx.can_write(&ctx.db_table));
        assert!(!ctx.can_sql());
        ctx.validate(&[Check::Connection, Check::Schema, Check::Table]).expect("valid");
    }

    #[test]
    fn missing_token_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state_with_project(dir.path(), false);

        let ctx = ReqCtx::new(
            &state,
            parts("sqlite_test", "main", "place"),
            &HeaderMap::new(),
            &HashMap::new(),
        )
        .expect("ctx");

        let err = ctx.validate(&[Check::Connection]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid token or forbidden");
        assert!(matches!(err, ApiError::Forbidden { .. }));
    }

    #[test]
    fn unknown_token_value_resolves_to_no_roles() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state_with_project(dir.path(), false);

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "wrong-secret".parse().unwrap());
        let ctx = ReqCtx::new(&state, parts("sqlite_test", "main", "place"), &headers, &HashMap::new())
            .expect("ctx");
        assert!(ctx.roles.is_empty());
    }

    #[test]
    fn table_outside_grant_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let (state, secret) = state_with_project(dir.path(), false);

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", secret.parse().unwrap());
        let ctx = ReqCtx::new(&state, parts("sqlite_test", "main", "place2"), &headers, &HashMap::new())
            .expect("ctx");

        let err = ctx.validate(&[Check::Connection, Check::Table]).unwrap_err();
        assert!(matches!(err, ApiError::Forbidden { .. }));
    }

    #[test]
    fn missing_fields_report_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let (state, secret) = state_with_project(dir.path(), false);

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", secret.parse().unwrap());
        let ctx = ReqCtx::new(&state, PathParts::default(), &headers, &HashMap::new())
            .expect("ctx");

        let err = ctx.validate(&[Check::Connection, Check::Id]).unwrap_err();
        assert!(matches!(err, ApiError::BadInput { .. }));
        assert!(err.to_string().contains("connection"));
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn no_restriction_grants_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state_with_project(dir.path(), true);

        let ctx = ReqCtx::new(
            &state,
            parts("sqlite_test", "main", "place2"),
            &HeaderMap::new(),
            &HashMap::new(),
        )
        .expect("ctx");

        assert!(ctx.can_read(&ctx.db_table));
        assert!(ctx.can_write(&ctx.db_table));
        assert!(ctx.can_sql());
    }

    #[test]
    fn disabled_token_resolves_to_no_roles() {
        let dir = tempfile::tempdir().unwrap();
        let (state, secret) = state_with_project(dir.path(), false);
        let project = state.project(DEFAULT_PROJECT_ID).unwrap().unwrap();
        project.token_toggle("t").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", secret.parse().unwrap());
        let ctx = ReqCtx::new(&state, parts("sqlite_test", "main", "place"), &headers, &HashMap::new())
            .expect("ctx");
        assert!(ctx.roles.is_empty());
    }

    #[test]
    fn id_and_schema_fall_back_to_query_params() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state_with_project(dir.path(), true);

        let query: HashMap<String, String> =
            [("id".to_string(), "q-7".to_string()), ("schema".to_string(), "main".to_string())]
                .into_iter()
                .collect();
        let ctx = ReqCtx::new(&state, parts("sqlite_test", "", ""), &HeaderMap::new(), &query)
            .expect("ctx");
        assert_eq!(ctx.id, "q-7");
        assert_eq!(ctx.schema, "main");
    }

    #[test]
    fn unknown_project_header_is_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state_with_project(dir.path(), false);

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_PROJECT_ID, "ghost".parse().unwrap());
        let result = ReqCtx::new(&state, parts("sqlite_test", "", ""), &headers, &HashMap::new());
        assert!(matches!(result, Err(ApiError::BadInput { .. })));
    }
}
