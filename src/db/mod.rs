//! The database handle seam.
//!
//! Everything dialect-specific lives behind [`DatabaseClient`]: streaming
//! SELECTs, multi-statement execution, transactions, introspection, and the
//! analysis/metadata template library. The gateway itself never talks to a
//! driver directly; it holds `Arc<dyn DatabaseClient>` handles owned by the
//! per-project connection registry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod decode;
pub mod sqlite;

pub use decode::DecodedStream;

/// Errors produced by database handles.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DbError {
    /// The handle could not reach the database.
    #[snafu(display("could not connect: {message}"))]
    Connect {
        /// Driver-reported cause.
        message: String,
    },

    /// A statement failed to prepare or execute.
    #[snafu(display("query failed: {message}"))]
    Query {
        /// Driver-reported cause.
        message: String,
    },

    /// The execution context was cancelled.
    #[snafu(display("operation cancelled"))]
    Cancelled,

    /// The handle has been closed.
    #[snafu(display("connection is closed"))]
    Closed,

    /// An inbound record could not be decoded.
    #[snafu(display("could not decode input: {message}"))]
    Decode {
        /// What failed while decoding.
        message: String,
    },

    /// The driver does not support the requested operation.
    #[snafu(display("unsupported: {what}"))]
    Unsupported {
        /// Name of the missing capability.
        what: String,
    },
}

/// Supported driver dialects.
///
/// Dialect differences (row caps, identifier quoting) stay behind this enum
/// and the handle; route handlers never branch on it except through
/// [`DriverKind::select_cap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// SQLite (bundled implementation).
    Sqlite,
    /// PostgreSQL.
    Postgres,
    /// MySQL.
    Mysql,
    /// Microsoft SQL Server.
    SqlServer,
    /// DuckDB.
    Duckdb,
}

impl DriverKind {
    /// Parse a driver kind from a descriptor `type` field or URL scheme.
    pub fn parse(s: &str) -> Option<DriverKind> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(DriverKind::Sqlite),
            "postgres" | "postgresql" => Some(DriverKind::Postgres),
            "mysql" | "mariadb" => Some(DriverKind::Mysql),
            "sqlserver" | "mssql" => Some(DriverKind::SqlServer),
            "duckdb" => Some(DriverKind::Duckdb),
            _ => None,
        }
    }

    /// Canonical lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            DriverKind::Sqlite => "sqlite",
            DriverKind::Postgres => "postgres",
            DriverKind::Mysql => "mysql",
            DriverKind::SqlServer => "sqlserver",
            DriverKind::Duckdb => "duckdb",
        }
    }

    /// How a row cap is spelled for this dialect.
    ///
    /// SQL Server takes `select top N ...`; everyone else takes a trailing
    /// `limit N`.
    pub fn select_cap(&self, limit: i64) -> SelectCap {
        match self {
            DriverKind::SqlServer => SelectCap::Top(limit),
            _ => SelectCap::Limit(limit),
        }
    }

    /// The identifier quote pair for this dialect.
    fn quotes(&self) -> (char, char) {
        match self {
            DriverKind::Mysql => ('`', '`'),
            DriverKind::SqlServer => ('[', ']'),
            _ => ('"', '"'),
        }
    }

    /// Quote a single identifier for SQL generation.
    pub fn quote_ident(&self, ident: &str) -> String {
        let (open, close) = self.quotes();
        format!("{open}{ident}{close}")
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Placement of a row cap in a generated SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectCap {
    /// `select top N ...` (SQL Server).
    Top(i64),
    /// `... limit N` (everyone else).
    Limit(i64),
}

/// A parsed `schema.table` reference.
///
/// Identifier case is preserved exactly as the dialect parser returned it;
/// grant matching is case-sensitive on these fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TableRef {
    /// Schema part; empty for bare or wildcard references.
    pub schema: String,
    /// Table name part; `*` for wildcard references.
    pub name: String,
}

impl TableRef {
    /// Parse `schema.table`, `schema.*`, `table`, or `*` per the dialect's
    /// quoting rules.
    pub fn parse(text: &str, kind: DriverKind) -> TableRef {
        let (open, close) = kind.quotes();
        let unquote = |part: &str| -> String {
            let part = part.trim();
            let stripped = part
                .strip_prefix(open)
                .and_then(|p| p.strip_suffix(close));
            stripped.unwrap_or(part).to_string()
        };

        match text.split_once('.') {
            Some((schema, name)) => TableRef { schema: unquote(schema), name: unquote(name) },
            None => TableRef { schema: String::new(), name: unquote(text) },
        }
    }

    /// The `schema.*` reference covering every table in `schema`.
    pub fn schema_all(schema: &str) -> TableRef {
        TableRef { schema: schema.to_string(), name: "*".to_string() }
    }

    /// `schema.name`, or just `name` when there is no schema part.
    pub fn full_name(&self) -> String {
        if self.schema.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }

    /// Dialect-quoted form for SQL generation.
    pub fn quoted(&self, kind: DriverKind) -> String {
        if self.schema.is_empty() {
            kind.quote_ident(&self.name)
        } else {
            format!("{}.{}", kind.quote_ident(&self.schema), kind.quote_ident(&self.name))
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Int(i64),
    /// Double-precision float.
    Real(f64),
    /// Text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
    /// Boolean.
    Bool(bool),
}

impl Value {
    /// Render for delimited-text output. NULL renders as the empty string.
    pub fn display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Text(v) => v.clone(),
            Value::Blob(v) => String::from_utf8_lossy(v).into_owned(),
            Value::Bool(v) => v.to_string(),
        }
    }

    /// Convert to a JSON value, preserving the native type.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Real(v) => serde_json::Value::from(*v),
            Value::Text(v) => serde_json::Value::from(v.clone()),
            Value::Blob(v) => serde_json::Value::from(String::from_utf8_lossy(v).into_owned()),
            Value::Bool(v) => serde_json::Value::from(*v),
        }
    }

    /// Convert to JSON with non-null values cast to strings.
    ///
    /// Used by the buffered JSON response format so 64-bit integers survive
    /// JavaScript's 53-bit number range.
    pub fn to_json_string_cast(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            other => serde_json::Value::from(other.display()),
        }
    }

    /// Best-effort conversion from a JSON value.
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Real(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }
}

/// One result row.
pub type Row = Vec<Value>;

/// Broad column type classification, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Text-like.
    String,
    /// Integral.
    Integer,
    /// Floating point / numeric.
    Decimal,
    /// Boolean.
    Bool,
    /// Date or timestamp.
    Datetime,
    /// Binary.
    Binary,
}

impl ColumnType {
    /// Classify a driver-reported declared type.
    pub fn from_db_type(db_type: &str) -> ColumnType {
        let t = db_type.to_lowercase();
        if t.contains("int") {
            ColumnType::Integer
        } else if t.contains("bool") {
            ColumnType::Bool
        } else if t.contains("real")
            || t.contains("floa")
            || t.contains("doub")
            || t.contains("dec")
            || t.contains("num")
        {
            ColumnType::Decimal
        } else if t.contains("date") || t.contains("time") {
            ColumnType::Datetime
        } else if t.contains("blob") || t.contains("binary") {
            ColumnType::Binary
        } else {
            ColumnType::String
        }
    }

    /// Lowercase name, as serialized.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Decimal => "decimal",
            ColumnType::Bool => "bool",
            ColumnType::Datetime => "datetime",
            ColumnType::Binary => "binary",
        }
    }
}

/// A result column: name, classified type, and the raw driver type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Classified type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Declared type as reported by the driver.
    pub db_type: String,
}

impl Column {
    /// Build a string column, the common case for metadata datasets.
    pub fn text(name: &str) -> Column {
        Column {
            name: name.to_string(),
            column_type: ColumnType::String,
            db_type: "text".to_string(),
        }
    }

    /// Build an integer column.
    pub fn integer(name: &str) -> Column {
        Column {
            name: name.to_string(),
            column_type: ColumnType::Integer,
            db_type: "integer".to_string(),
        }
    }
}

/// Ordered column schema.
pub type Columns = Vec<Column>;

/// Column names in order.
pub fn column_names(columns: &Columns) -> Vec<String> {
    columns.iter().map(|c| c.name.clone()).collect()
}

/// A lazy, finite, non-restartable sequence of rows.
///
/// Consuming blocks on the producer; cancelling the attached token
/// terminates the producer, which closes the channel.
pub struct RowStream {
    columns: Columns,
    rx: mpsc::Receiver<Result<Row, DbError>>,
    ctx: CancellationToken,
}

impl RowStream {
    /// Create a stream from a schema, a row channel, and its execution
    /// context.
    pub fn new(
        columns: Columns,
        rx: mpsc::Receiver<Result<Row, DbError>>,
        ctx: CancellationToken,
    ) -> RowStream {
        RowStream { columns, rx, ctx }
    }

    /// The column schema, known before the first row.
    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// Await the next row. `None` once the stream is exhausted.
    pub async fn next_row(&mut self) -> Option<Result<Row, DbError>> {
        self.rx.recv().await
    }

    /// Cancel the producer. Safe to call more than once.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        // An abandoned stream must not leave the producer pumping rows.
        self.ctx.cancel();
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("columns", &self.columns.len())
            .finish()
    }
}

/// A fully-buffered result, used only where results are known to be small.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    /// Column schema.
    pub columns: Columns,
    /// Buffered rows.
    pub rows: Vec<Row>,
}

impl Dataset {
    /// An empty dataset with the given schema.
    pub fn new(columns: Columns) -> Dataset {
        Dataset { columns, rows: Vec::new() }
    }

    /// Append a row.
    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Sort rows lexicographically by the given column indexes.
    pub fn sort_by_columns(&mut self, keys: &[usize]) {
        self.rows.sort_by(|a, b| {
            for &k in keys {
                let (x, y) = (a.get(k), b.get(k));
                let ord = match (x, y) {
                    (Some(x), Some(y)) => x.display().cmp(&y.display()),
                    _ => std::cmp::Ordering::Equal,
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
}

/// Result of a multi-statement execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
    /// Total rows affected across all statements.
    pub rows_affected: u64,
}

/// Options for a streaming SELECT.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Row cap; `-1` means unlimited.
    pub limit: i64,
    /// Bound parameters, in statement order.
    pub params: Vec<Value>,
}

/// Introspection depth for [`DatabaseClient::get_schemata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemataLevel {
    /// Schema names only.
    Schema,
    /// Schemas and tables.
    Table,
    /// Schemas, tables, and columns.
    Column,
}

/// One column of one table, as reported by introspection.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// 1-based position.
    pub position: i64,
    /// Column name.
    pub name: String,
    /// Declared type.
    pub db_type: String,
}

/// One table, as reported by introspection.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Owning database.
    pub database: String,
    /// Owning schema.
    pub schema: String,
    /// Table name.
    pub name: String,
    /// Whether this is a view.
    pub is_view: bool,
    /// Columns, populated at [`SchemataLevel::Column`].
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    /// The table reference for permission checks.
    pub fn table_ref(&self) -> TableRef {
        TableRef { schema: self.schema.clone(), name: self.name.clone() }
    }
}

/// Introspection result.
#[derive(Debug, Clone, Default)]
pub struct Schemata {
    /// Schema names, populated at every level.
    pub schemas: Vec<String>,
    /// Tables, populated at [`SchemataLevel::Table`] and deeper.
    pub tables: Vec<TableInfo>,
}

/// The polymorphic driver-facing capability set.
///
/// Handles are shared across concurrent requests and assumed internally
/// synchronised. All blocking driver work happens off the async runtime.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// The driver dialect.
    fn kind(&self) -> DriverKind;

    /// The default database of this handle, if the driver has the concept.
    fn database(&self) -> String;

    /// The handle-level cancellation context.
    ///
    /// Per-query execution contexts derive from this token, so closing the
    /// handle aborts everything in flight.
    fn root_context(&self) -> CancellationToken;

    /// Cheap round-trip to verify the connection is alive.
    async fn ping(&self) -> Result<(), DbError>;

    /// Open a streaming cursor for a single SELECT-shaped statement.
    async fn stream(
        &self,
        ctx: CancellationToken,
        sql: &str,
        opts: StreamOptions,
    ) -> Result<RowStream, DbError>;

    /// Execute one or more statements, returning the total affected count.
    async fn exec_multi(&self, ctx: CancellationToken, sql: &str) -> Result<ExecResult, DbError>;

    /// Begin a transaction on the handle.
    async fn begin(&self) -> Result<(), DbError>;

    /// Commit the open transaction.
    async fn commit(&self) -> Result<(), DbError>;

    /// Roll back the open transaction. A no-op when nothing is open.
    async fn rollback(&self) -> Result<(), DbError>;

    /// List databases visible to this handle.
    async fn get_databases(&self) -> Result<Dataset, DbError>;

    /// Introspect schemas/tables/columns, optionally filtered.
    async fn get_schemata(
        &self,
        level: SchemataLevel,
        schema: &str,
        table: &str,
    ) -> Result<Schemata, DbError>;

    /// List indexes of a table.
    async fn get_indexes(&self, table: &TableRef) -> Result<Dataset, DbError>;

    /// List primary key columns of a table.
    async fn get_primary_keys(&self, table: &TableRef) -> Result<Dataset, DbError>;

    /// Render a named analysis template with the given data.
    fn get_analysis(
        &self,
        name: &str,
        data: &BTreeMap<String, serde_json::Value>,
    ) -> Result<String, DbError>;

    /// Look up a named metadata template.
    fn metadata_template(&self, name: &str) -> Option<String>;

    /// Insert a decoded record stream into `table` on the open transaction.
    async fn insert_batch(
        &self,
        ctx: CancellationToken,
        table: &TableRef,
        data: DecodedStream,
    ) -> Result<u64, DbError>;

    /// Close the handle. Subsequent calls fail with [`DbError::Closed`].
    async fn close(&self);
}

/// Split a script into individual statements.
///
/// Splits on `;` outside of string literals, line comments, and block
/// comments. Comment-only fragments are dropped, so a statement wrapped in a
/// leading directive comment still counts as one statement.
pub fn split_statements(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let rest = &text[i..];
        if rest.starts_with("--") {
            let end = rest.find('\n').map(|p| i + p + 1).unwrap_or(bytes.len());
            i = end;
            continue;
        }
        if rest.starts_with("/*") {
            let end = rest.find("*/").map(|p| i + p + 2).unwrap_or(bytes.len());
            i = end;
            continue;
        }
        let c = rest.chars().next().unwrap();
        match c {
            '\'' | '"' => {
                // consume the quoted literal, honoring doubled quotes
                current.push(c);
                i += c.len_utf8();
                while i < bytes.len() {
                    let ch = text[i..].chars().next().unwrap();
                    current.push(ch);
                    i += ch.len_utf8();
                    if ch == c {
                        if text[i..].starts_with(c) {
                            current.push(c);
                            i += c.len_utf8();
                        } else {
                            break;
                        }
                    }
                }
            }
            ';' => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    out.push(stmt.to_string());
                }
                current.clear();
                i += 1;
            }
            _ => {
                current.push(c);
                i += c.len_utf8();
            }
        }
    }

    let stmt = current.trim();
    if !stmt.is_empty() {
        out.push(stmt.to_string());
    }
    out
}

/// Whether a statement should be executed as a streaming cursor.
pub fn is_select_shaped(sql: &str) -> bool {
    let lowered = sql.trim().to_lowercase();
    lowered.starts_with("select")
        || lowered.starts_with("with")
        || (lowered.contains("select") && lowered.contains("from"))
}

/// Render a `{key}` template against a data map.
pub fn render_template(template: &str, data: &BTreeMap<String, serde_json::Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in data {
        let needle = format!("{{{key}}}");
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&needle, &replacement);
    }
    out
}
