//! Bundled SQLite implementation of [`DatabaseClient`].
//!
//! SQLite connections are not `Sync`, so the handle runs a dedicated actor
//! thread that owns the `rusqlite::Connection` and services commands from a
//! channel. Streaming results are pumped from the actor into a bounded row
//! channel, which gives natural backpressure against the HTTP writer. Long
//! statements are aborted through SQLite's interrupt handle when the
//! execution context is cancelled.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::decode::DecodedStream;
use super::{
    render_template, split_statements, Column, ColumnInfo, ColumnType, Columns, Dataset, DbError,
    DriverKind, ExecResult, Row, RowStream, Schemata, SchemataLevel, StreamOptions, TableInfo,
    TableRef, Value,
};

/// Row channel depth between the actor and a consumer.
const STREAM_BUFFER: usize = 200;

/// Analysis templates known to this driver.
const ANALYSIS_TEMPLATES: &[(&str, &str)] = &[
    ("row_count", "select count(*) as row_count from {schema}.{table}"),
    (
        "distinct_count",
        "select count(distinct {field}) as distinct_count from {schema}.{table}",
    ),
    (
        "null_count",
        "select count(*) as null_count from {schema}.{table} where {field} is null",
    ),
];

/// Metadata templates known to this driver.
const METADATA_TEMPLATES: &[(&str, &str)] = &[
    (
        "ddl_table",
        "select sql as ddl from {schema}.sqlite_master where type = 'table' and name = '{table}'",
    ),
    (
        "ddl_view",
        "select sql as ddl from {schema}.sqlite_master where type = 'view' and name = '{table}'",
    ),
];

enum Command {
    Ping {
        reply: oneshot::Sender<Result<(), DbError>>,
    },
    Stream {
        sql: String,
        opts: StreamOptions,
        ctx: CancellationToken,
        reply: oneshot::Sender<Result<RowStream, DbError>>,
        // dropped by the actor when the pump ends; releases the cancel watcher
        _finished: oneshot::Sender<()>,
    },
    ExecMulti {
        sql: String,
        ctx: CancellationToken,
        reply: oneshot::Sender<Result<ExecResult, DbError>>,
        _finished: oneshot::Sender<()>,
    },
    Begin {
        reply: oneshot::Sender<Result<(), DbError>>,
    },
    Commit {
        reply: oneshot::Sender<Result<(), DbError>>,
    },
    Rollback {
        reply: oneshot::Sender<Result<(), DbError>>,
    },
    Databases {
        reply: oneshot::Sender<Result<Dataset, DbError>>,
    },
    GetSchemata {
        level: SchemataLevel,
        schema: String,
        table: String,
        reply: oneshot::Sender<Result<Schemata, DbError>>,
    },
    Indexes {
        table: TableRef,
        reply: oneshot::Sender<Result<Dataset, DbError>>,
    },
    PrimaryKeys {
        table: TableRef,
        reply: oneshot::Sender<Result<Dataset, DbError>>,
    },
    InsertBatch {
        table: TableRef,
        data: DecodedStream,
        ctx: CancellationToken,
        reply: oneshot::Sender<Result<u64, DbError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// A live SQLite handle.
pub struct SqliteClient {
    path: String,
    tx: mpsc::Sender<Command>,
    interrupt: Arc<rusqlite::InterruptHandle>,
    root: CancellationToken,
    closed: AtomicBool,
}

impl SqliteClient {
    /// Open (or create) the database at `path`. `:memory:` works.
    pub async fn open(path: impl Into<String>) -> Result<SqliteClient, DbError> {
        let path = path.into();
        let (tx, rx) = mpsc::channel::<Command>(16);
        let (init_tx, init_rx) = oneshot::channel();

        let actor_path = path.clone();
        std::thread::Builder::new()
            .name("sqlite-client".to_string())
            .spawn(move || actor_main(actor_path, rx, init_tx))
            .map_err(|e| DbError::Connect { message: e.to_string() })?;

        let interrupt = init_rx
            .await
            .map_err(|_| DbError::Connect { message: "sqlite actor exited".to_string() })??;

        Ok(SqliteClient {
            path,
            tx,
            interrupt: Arc::new(interrupt),
            root: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// The file path (or `:memory:`) this handle is bound to.
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn send(&self, cmd: Command) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        self.tx.send(cmd).await.map_err(|_| DbError::Closed)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, DbError>>) -> Command,
    ) -> Result<T, DbError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx.await.map_err(|_| DbError::Closed)?
    }

    /// Arrange for `interrupt()` when `ctx` is cancelled. The returned sender
    /// travels with the command; the actor drops it once the statement is
    /// done, which releases the watcher.
    fn watch_cancel(&self, ctx: &CancellationToken) -> oneshot::Sender<()> {
        let (finished_tx, finished_rx) = oneshot::channel::<()>();
        let interrupt = Arc::clone(&self.interrupt);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => interrupt.interrupt(),
                _ = finished_rx => {}
            }
        });
        finished_tx
    }
}

#[async_trait]
impl super::DatabaseClient for SqliteClient {
    fn kind(&self) -> DriverKind {
        DriverKind::Sqlite
    }

    fn database(&self) -> String {
        "main".to_string()
    }

    fn root_context(&self) -> CancellationToken {
        self.root.clone()
    }

    async fn ping(&self) -> Result<(), DbError> {
        self.call(|reply| Command::Ping { reply }).await
    }

    async fn stream(
        &self,
        ctx: CancellationToken,
        sql: &str,
        opts: StreamOptions,
    ) -> Result<RowStream, DbError> {
        let finished = self.watch_cancel(&ctx);
        self.call(|reply| Command::Stream {
            sql: sql.to_string(),
            opts,
            ctx,
            reply,
            _finished: finished,
        })
        .await
    }

    async fn exec_multi(&self, ctx: CancellationToken, sql: &str) -> Result<ExecResult, DbError> {
        let finished = self.watch_cancel(&ctx);
        self.call(|reply| Command::ExecMulti {
            sql: sql.to_string(),
            ctx,
            reply,
            _finished: finished,
        })
        .await
    }

    async fn begin(&self) -> Result<(), DbError> {
        self.call(|reply| Command::Begin { reply }).await
    }

    async fn commit(&self) -> Result<(), DbError> {
        self.call(|reply| Command::Commit { reply }).await
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.call(|reply| Command::Rollback { reply }).await
    }

    async fn get_databases(&self) -> Result<Dataset, DbError> {
        self.call(|reply| Command::Databases { reply }).await
    }

    async fn get_schemata(
        &self,
        level: SchemataLevel,
        schema: &str,
        table: &str,
    ) -> Result<Schemata, DbError> {
        self.call(|reply| Command::GetSchemata {
            level,
            schema: schema.to_string(),
            table: table.to_string(),
            reply,
        })
        .await
    }

    async fn get_indexes(&self, table: &TableRef) -> Result<Dataset, DbError> {
        self.call(|reply| Command::Indexes { table: table.clone(), reply }).await
    }

    async fn get_primary_keys(&self, table: &TableRef) -> Result<Dataset, DbError> {
        self.call(|reply| Command::PrimaryKeys { table: table.clone(), reply }).await
    }

    fn get_analysis(
        &self,
        name: &str,
        data: &BTreeMap<String, serde_json::Value>,
    ) -> Result<String, DbError> {
        let template = ANALYSIS_TEMPLATES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| *t)
            .ok_or_else(|| DbError::Unsupported { what: format!("analysis '{name}'") })?;
        Ok(render_template(template, data))
    }

    fn metadata_template(&self, name: &str) -> Option<String> {
        METADATA_TEMPLATES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t.to_string())
    }

    async fn insert_batch(
        &self,
        ctx: CancellationToken,
        table: &TableRef,
        data: DecodedStream,
    ) -> Result<u64, DbError> {
        self.call(|reply| Command::InsertBatch { table: table.clone(), data, ctx, reply }).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.root.cancel();
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Close { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

impl std::fmt::Debug for SqliteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteClient").field("path", &self.path).finish()
    }
}

fn actor_main(
    path: String,
    mut rx: mpsc::Receiver<Command>,
    init_tx: oneshot::Sender<Result<rusqlite::InterruptHandle, DbError>>,
) {
    let conn = match Connection::open(&path) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = init_tx.send(Err(DbError::Connect { message: e.to_string() }));
            return;
        }
    };
    if init_tx.send(Ok(conn.get_interrupt_handle())).is_err() {
        return;
    }

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::Ping { reply } => {
                let result = conn
                    .query_row("select 1", [], |_| Ok(()))
                    .map_err(|e| DbError::Query { message: e.to_string() });
                let _ = reply.send(result);
            }
            Command::Stream { sql, opts, ctx, reply, _finished } => {
                run_stream(&conn, &sql, opts, ctx, reply);
            }
            Command::ExecMulti { sql, ctx, reply, _finished } => {
                let _ = reply.send(run_exec_multi(&conn, &sql, &ctx));
            }
            Command::Begin { reply } => {
                let _ = reply.send(exec_simple(&conn, "BEGIN"));
            }
            Command::Commit { reply } => {
                let result = if conn.is_autocommit() {
                    Ok(())
                } else {
                    exec_simple(&conn, "COMMIT")
                };
                let _ = reply.send(result);
            }
            Command::Rollback { reply } => {
                let result = if conn.is_autocommit() {
                    Ok(())
                } else {
                    exec_simple(&conn, "ROLLBACK")
                };
                let _ = reply.send(result);
            }
            Command::Databases { reply } => {
                let _ = reply.send(list_databases(&conn));
            }
            Command::GetSchemata { level, schema, table, reply } => {
                let _ = reply.send(get_schemata(&conn, level, &schema, &table));
            }
            Command::Indexes { table, reply } => {
                let _ = reply.send(list_indexes(&conn, &table));
            }
            Command::PrimaryKeys { table, reply } => {
                let _ = reply.send(list_primary_keys(&conn, &table));
            }
            Command::InsertBatch { table, mut data, ctx, reply } => {
                let _ = reply.send(run_insert_batch(&conn, &table, &mut data, &ctx));
            }
            Command::Close { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
}

fn exec_simple(conn: &Connection, sql: &str) -> Result<(), DbError> {
    conn.execute_batch(sql).map_err(|e| DbError::Query { message: e.to_string() })
}

fn query_error(e: rusqlite::Error, ctx: &CancellationToken) -> DbError {
    if ctx.is_cancelled() {
        DbError::Cancelled
    } else {
        DbError::Query { message: e.to_string() }
    }
}

fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Int(v) => rusqlite::types::Value::Integer(*v),
        Value::Real(v) => rusqlite::types::Value::Real(*v),
        Value::Text(v) => rusqlite::types::Value::Text(v.clone()),
        Value::Blob(v) => rusqlite::types::Value::Blob(v.clone()),
        Value::Bool(v) => rusqlite::types::Value::Integer(i64::from(*v)),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}

fn statement_columns(stmt: &rusqlite::Statement<'_>) -> Columns {
    stmt.columns()
        .iter()
        .map(|c| {
            let db_type = c.decl_type().unwrap_or("").to_string();
            Column {
                name: c.name().to_string(),
                column_type: ColumnType::from_db_type(&db_type),
                db_type,
            }
        })
        .collect()
}

fn read_row(row: &rusqlite::Row<'_>, width: usize) -> Result<Row, rusqlite::Error> {
    (0..width).map(|i| row.get_ref(i).map(from_value_ref)).collect()
}

/// Prepare, fetch the first row, reply with the stream head, then pump rows
/// until exhaustion, cancellation, or consumer hang-up.
///
/// The head resolves only once the first row (or end of the result) is
/// known: a query interrupted before producing anything fails the
/// submission instead of handing back a cursor that never yields.
fn run_stream(
    conn: &Connection,
    sql: &str,
    opts: StreamOptions,
    ctx: CancellationToken,
    reply: oneshot::Sender<Result<RowStream, DbError>>,
) {
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = reply.send(Err(query_error(e, &ctx)));
            return;
        }
    };
    let columns = statement_columns(&stmt);
    let width = columns.len();

    let params = rusqlite::params_from_iter(opts.params.iter().map(to_sql_value));
    let mut rows = match stmt.query(params) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = reply.send(Err(query_error(e, &ctx)));
            return;
        }
    };

    let first = match rows.next() {
        Ok(Some(row)) => match read_row(row, width) {
            Ok(values) => Some(values),
            Err(e) => {
                let _ = reply.send(Err(query_error(e, &ctx)));
                return;
            }
        },
        Ok(None) => None,
        Err(e) => {
            let _ = reply.send(Err(query_error(e, &ctx)));
            return;
        }
    };

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    if reply.send(Ok(RowStream::new(columns, rx, ctx.clone()))).is_err() {
        return;
    }

    let mut sent: i64 = 0;
    match first {
        Some(values) => {
            // capacity is fresh, this cannot fail
            let _ = tx.try_send(Ok(values));
            sent += 1;
        }
        None => return,
    }

    loop {
        if ctx.is_cancelled() {
            return;
        }
        if opts.limit > 0 && sent >= opts.limit {
            return;
        }
        match rows.next() {
            Ok(Some(row)) => match read_row(row, width) {
                Ok(values) => {
                    if tx.blocking_send(Ok(values)).is_err() {
                        // consumer went away; stop pumping
                        ctx.cancel();
                        return;
                    }
                    sent += 1;
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(query_error(e, &ctx)));
                    return;
                }
            },
            Ok(None) => return,
            Err(e) => {
                let _ = tx.blocking_send(Err(query_error(e, &ctx)));
                return;
            }
        }
    }
}

fn run_exec_multi(conn: &Connection, sql: &str, ctx: &CancellationToken) -> Result<ExecResult, DbError> {
    let mut affected: u64 = 0;
    for statement in split_statements(sql) {
        if ctx.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let mut stmt = conn.prepare(&statement).map_err(|e| query_error(e, ctx))?;
        if stmt.column_count() == 0 {
            affected += stmt.execute([]).map_err(|e| query_error(e, ctx))? as u64;
        } else {
            // drain result-producing statements without buffering
            let mut rows = stmt.query([]).map_err(|e| query_error(e, ctx))?;
            while rows.next().map_err(|e| query_error(e, ctx))?.is_some() {
                if ctx.is_cancelled() {
                    return Err(DbError::Cancelled);
                }
            }
        }
    }
    Ok(ExecResult { rows_affected: affected })
}

fn run_insert_batch(
    conn: &Connection,
    table: &TableRef,
    data: &mut DecodedStream,
    ctx: &CancellationToken,
) -> Result<u64, DbError> {
    let columns = data.columns().to_vec();
    if columns.is_empty() {
        return Ok(0);
    }

    let kind = DriverKind::Sqlite;
    let column_list = columns
        .iter()
        .map(|c| kind.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let insert_sql = format!(
        "insert into {} ({}) values ({})",
        table.quoted(kind),
        column_list,
        placeholders
    );
    let mut stmt = conn.prepare(&insert_sql).map_err(|e| query_error(e, ctx))?;

    let mut count: u64 = 0;
    while let Some(row) = data.blocking_next_row() {
        if ctx.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let row = row?;
        let params = rusqlite::params_from_iter(row.iter().map(to_sql_value));
        stmt.execute(params).map_err(|e| query_error(e, ctx))?;
        count += 1;
    }
    Ok(count)
}

fn list_databases(conn: &Connection) -> Result<Dataset, DbError> {
    let mut data = Dataset::new(vec![Column::text("name"), Column::text("file")]);
    let mut stmt = conn
        .prepare("pragma database_list")
        .map_err(|e| DbError::Query { message: e.to_string() })?;
    let mut rows = stmt.query([]).map_err(|e| DbError::Query { message: e.to_string() })?;
    while let Some(row) = rows.next().map_err(|e| DbError::Query { message: e.to_string() })? {
        let name: String = row.get(1).map_err(|e| DbError::Query { message: e.to_string() })?;
        let file: String = row.get(2).unwrap_or_default();
        data.push(vec![Value::Text(name), Value::Text(file)]);
    }
    Ok(data)
}

fn schema_names(conn: &Connection) -> Result<Vec<String>, DbError> {
    let databases = list_databases(conn)?;
    Ok(databases
        .rows
        .iter()
        .filter_map(|r| match r.first() {
            Some(Value::Text(name)) => Some(name.clone()),
            _ => None,
        })
        .collect())
}

fn get_schemata(
    conn: &Connection,
    level: SchemataLevel,
    schema: &str,
    table: &str,
) -> Result<Schemata, DbError> {
    let kind = DriverKind::Sqlite;
    let all_schemas = schema_names(conn)?;
    let selected: Vec<String> = if schema.is_empty() {
        all_schemas.clone()
    } else {
        all_schemas.iter().filter(|s| *s == schema).cloned().collect()
    };

    let mut schemata = Schemata { schemas: selected.clone(), tables: Vec::new() };
    if level == SchemataLevel::Schema {
        return Ok(schemata);
    }

    for schema_name in &selected {
        let master = format!(
            "select name, type from {}.sqlite_master where type in ('table', 'view') \
             and name not like 'sqlite_%' order by name",
            kind.quote_ident(schema_name)
        );
        let mut stmt =
            conn.prepare(&master).map_err(|e| DbError::Query { message: e.to_string() })?;
        let mut rows = stmt.query([]).map_err(|e| DbError::Query { message: e.to_string() })?;
        while let Some(row) = rows.next().map_err(|e| DbError::Query { message: e.to_string() })? {
            let name: String =
                row.get(0).map_err(|e| DbError::Query { message: e.to_string() })?;
            let table_type: String =
                row.get(1).map_err(|e| DbError::Query { message: e.to_string() })?;
            if !table.is_empty() && name != table {
                continue;
            }
            let columns = if level == SchemataLevel::Column {
                table_columns(conn, schema_name, &name)?
            } else {
                Vec::new()
            };
            schemata.tables.push(TableInfo {
                database: "main".to_string(),
                schema: schema_name.clone(),
                name,
                is_view: table_type == "view",
                columns,
            });
        }
    }
    Ok(schemata)
}

fn table_columns(
    conn: &Connection,
    schema: &str,
    table: &str,
) -> Result<Vec<ColumnInfo>, DbError> {
    let kind = DriverKind::Sqlite;
    let pragma = format!(
        "pragma {}.table_info({})",
        kind.quote_ident(schema),
        kind.quote_ident(table)
    );
    let mut stmt = conn.prepare(&pragma).map_err(|e| DbError::Query { message: e.to_string() })?;
    let mut rows = stmt.query([]).map_err(|e| DbError::Query { message: e.to_string() })?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next().map_err(|e| DbError::Query { message: e.to_string() })? {
        let cid: i64 = row.get(0).map_err(|e| DbError::Query { message: e.to_string() })?;
        let name: String = row.get(1).map_err(|e| DbError::Query { message: e.to_string() })?;
        let db_type: String = row.get(2).unwrap_or_default();
        columns.push(ColumnInfo { position: cid + 1, name, db_type });
    }
    Ok(columns)
}

fn list_indexes(conn: &Connection, table: &TableRef) -> Result<Dataset, DbError> {
    let kind = DriverKind::Sqlite;
    let schema = if table.schema.is_empty() { "main" } else { &table.schema };
    let mut data = Dataset::new(vec![
        Column::text("schema_name"),
        Column::text("table_name"),
        Column::text("index_name"),
        Column::text("column_name"),
        Column::integer("is_unique"),
    ]);

    let pragma = format!(
        "pragma {}.index_list({})",
        kind.quote_ident(schema),
        kind.quote_ident(&table.name)
    );
    let mut stmt = conn.prepare(&pragma).map_err(|e| DbError::Query { message: e.to_string() })?;
    let mut rows = stmt.query([]).map_err(|e| DbError::Query { message: e.to_string() })?;
    let mut indexes: Vec<(String, i64)> = Vec::new();
    while let Some(row) = rows.next().map_err(|e| DbError::Query { message: e.to_string() })? {
        let name: String = row.get(1).map_err(|e| DbError::Query { message: e.to_string() })?;
        let unique: i64 = row.get(2).unwrap_or(0);
        indexes.push((name, unique));
    }
    drop(rows);
    drop(stmt);

    for (index_name, unique) in indexes {
        let info = format!("pragma {}.index_info({})", kind.quote_ident(schema), kind.quote_ident(&index_name));
        let mut stmt =
            conn.prepare(&info).map_err(|e| DbError::Query { message: e.to_string() })?;
        let mut rows = stmt.query([]).map_err(|e| DbError::Query { message: e.to_string() })?;
        while let Some(row) = rows.next().map_err(|e| DbError::Query { message: e.to_string() })? {
            let column_name: String = row.get(2).unwrap_or_default();
            data.push(vec![
                Value::Text(schema.to_string()),
                Value::Text(table.name.clone()),
                Value::Text(index_name.clone()),
                Value::Text(column_name),
                Value::Int(unique),
            ]);
        }
    }
    Ok(data)
}

fn list_primary_keys(conn: &Connection, table: &TableRef) -> Result<Dataset, DbError> {
    let schema = if table.schema.is_empty() { "main" } else { &table.schema };
    let mut data = Dataset::new(vec![
        Column::text("schema_name"),
        Column::text("table_name"),
        Column::text("column_name"),
        Column::integer("position"),
    ]);
    for column in table_columns(conn, schema, &table.name)? {
        // pragma table_info marks pk membership with a 1-based ordinal
        let pk_position = pk_ordinal(conn, schema, &table.name, &column.name)?;
        if let Some(position) = pk_position {
            data.push(vec![
                Value::Text(schema.to_string()),
                Value::Text(table.name.clone()),
                Value::Text(column.name),
                Value::Int(position),
            ]);
        }
    }
    data.sort_by_columns(&[3]);
    Ok(data)
}

fn pk_ordinal(
    conn: &Connection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<Option<i64>, DbError> {
    let kind = DriverKind::Sqlite;
    let pragma = format!(
        "pragma {}.table_info({})",
        kind.quote_ident(schema),
        kind.quote_ident(table)
    );
    let mut stmt = conn.prepare(&pragma).map_err(|e| DbError::Query { message: e.to_string() })?;
    let mut rows = stmt.query([]).map_err(|e| DbError::Query { message: e.to_string() })?;
    while let Some(row) = rows.next().map_err(|e| DbError::Query { message: e.to_string() })? {
        let name: String = row.get(1).map_err(|e| DbError::Query { message: e.to_string() })?;
        let pk: i64 = row.get(5).unwrap_or(0);
        if name == column && pk > 0 {
            return Ok(Some(pk));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::super::DatabaseClient;
    use super::*;

    async fn test_client() -> SqliteClient {
        let client = SqliteClient::open(":memory:").await.expect("open sqlite");
        client
            .exec_multi(
                CancellationToken::new(),
                "create table place (id int primary key, country varchar(255), city varchar(255), telcode bigint); \
                 insert into place values (1, 'USA', 'Big City', 1); \
                 insert into place values (2, 'Canada', 'Small City', 1)",
            )
            .await
            .expect("seed");
        client
    }

    #[tokio::test]
    async fn ping_roundtrip() {
        let client = test_client().await;
        client.ping().await.expect("ping");
    }

    #[tokio::test]
    async fn streams_rows_in_order() {
        let client = test_client().await;
        let mut stream = client
            .stream(
                CancellationToken::new(),
                "select id, country from place order by id",
                StreamOptions::default(),
            )
            .await
            .expect("stream");
        assert_eq!(stream.columns().len(), 2);
        assert_eq!(stream.columns()[0].name, "id");

        let first = stream.next_row().await.unwrap().unwrap();
        assert_eq!(first[0], Value::Int(1));
        let second = stream.next_row().await.unwrap().unwrap();
        assert_eq!(second[0], Value::Int(2));
        assert!(stream.next_row().await.is_none());
    }

    #[tokio::test]
    async fn stream_respects_limit() {
        let client = test_client().await;
        let mut stream = client
            .stream(
                CancellationToken::new(),
                "select id from place order by id",
                StreamOptions { limit: 1, params: Vec::new() },
            )
            .await
            .expect("stream");
        assert!(stream.next_row().await.is_some());
        assert!(stream.next_row().await.is_none());
    }

    #[tokio::test]
    async fn stream_binds_parameters() {
        let client = test_client().await;
        let mut stream = client
            .stream(
                CancellationToken::new(),
                "select city from place where country = ?",
                StreamOptions { limit: -1, params: vec![Value::Text("USA".into())] },
            )
            .await
            .expect("stream");
        let row = stream.next_row().await.unwrap().unwrap();
        assert_eq!(row[0], Value::Text("Big City".into()));
        assert!(stream.next_row().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_interrupts_long_query() {
        let client = test_client().await;
        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        });

        // recursive CTE with a predicate that never matches: no rows are
        // ever produced, so only the interrupt can end it and the stream
        // head itself fails
        let long_query = "WITH RECURSIVE r(i) AS (VALUES(0) UNION ALL SELECT i FROM r LIMIT 100000000) \
                          SELECT i FROM r WHERE i = 1";
        let result = client.stream(ctx, long_query, StreamOptions::default()).await;
        assert!(matches!(result, Err(DbError::Cancelled)));
    }

    #[tokio::test]
    async fn exec_multi_counts_affected() {
        let client = test_client().await;
        let result = client
            .exec_multi(
                CancellationToken::new(),
                "insert into place values (3, 'Brazil', 'Tiny City', 2); \
                 update place set telcode = 9 where id = 3",
            )
            .await
            .expect("exec");
        assert_eq!(result.rows_affected, 2);
    }

    #[tokio::test]
    async fn transaction_rollback_discards_writes() {
        let client = test_client().await;
        client.begin().await.unwrap();
        client
            .exec_multi(CancellationToken::new(), "insert into place values (9, 'X', 'Y', 0)")
            .await
            .unwrap();
        client.rollback().await.unwrap();

        let mut stream = client
            .stream(
                CancellationToken::new(),
                "select count(*) from place where id = 9",
                StreamOptions::default(),
            )
            .await
            .unwrap();
        let row = stream.next_row().await.unwrap().unwrap();
        assert_eq!(row[0], Value::Int(0));
    }

    #[tokio::test]
    async fn introspects_schemata() {
        let client = test_client().await;
        let schemata = client
            .get_schemata(SchemataLevel::Column, "main", "place")
            .await
            .expect("schemata");
        assert_eq!(schemata.tables.len(), 1);
        let table = &schemata.tables[0];
        assert_eq!(table.schema, "main");
        assert_eq!(table.name, "place");
        assert_eq!(table.columns.len(), 4);
        assert_eq!(table.columns[0].name, "id");
    }

    #[tokio::test]
    async fn lists_primary_keys() {
        let client = test_client().await;
        let table = TableRef { schema: "main".into(), name: "place".into() };
        let keys = client.get_primary_keys(&table).await.expect("keys");
        assert_eq!(keys.rows.len(), 1);
        assert_eq!(keys.rows[0][2], Value::Text("id".into()));
    }

    #[tokio::test]
    async fn inserts_decoded_batch() {
        let client = test_client().await;
        let table = TableRef { schema: "main".into(), name: "place".into() };
        let data = DecodedStream::from_rows(
            vec!["id".into(), "country".into(), "city".into(), "telcode".into()],
            vec![
                vec![Value::Int(10), Value::Text("India".into()), Value::Text("Big City".into()), Value::Int(91)],
                vec![Value::Int(11), Value::Text("India".into()), Value::Text("Small City".into()), Value::Int(91)],
            ],
        );
        client.begin().await.unwrap();
        let affected = client
            .insert_batch(CancellationToken::new(), &table, data)
            .await
            .expect("insert");
        client.commit().await.unwrap();
        assert_eq!(affected, 2);
    }

    #[tokio::test]
    async fn analysis_and_metadata_templates() {
        let client = test_client().await;
        let mut data = BTreeMap::new();
        data.insert("schema".to_string(), serde_json::json!("main"));
        data.insert("table".to_string(), serde_json::json!("place"));
        let sql = client.get_analysis("row_count", &data).expect("analysis");
        assert_eq!(sql, "select count(*) as row_count from main.place");

        assert!(client.metadata_template("ddl_table").is_some());
        assert!(client.metadata_template("nope").is_none());
        assert!(client.get_analysis("nope", &data).is_err());
    }

    #[tokio::test]
    async fn close_rejects_further_commands() {
        let client = test_client().await;
        client.close().await;
        assert!(matches!(client.ping().await, Err(DbError::Closed)));
    }
}
