//! The query registry: submitted SQL executions and their lifecycle.
//!
//! A query reaches a terminal state exactly once:
//! `submitted -> {completed, errored, cancelled}`. The submitting task owns
//! all mutation; everyone else reads snapshots. The done signal is a watch
//! channel written exactly once, which lets any number of long-poll waiters
//! race it against their timeout window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::db::{
    is_select_shaped, render_template, split_statements, DatabaseClient, DbError, RowStream,
    StreamOptions, Value,
};

/// Default row cap for ad-hoc SQL when the caller passes none.
pub const DEFAULT_SQL_LIMIT: i64 = 500;

/// Errors from query submission and lookup.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueryError {
    /// A continuation referenced an id that is not in the registry.
    #[snafu(display("could not find query {id}"))]
    NotFound {
        /// The requested id.
        id: String,
    },

    /// A `/*-- ... --*/` directive could not be expanded.
    #[snafu(display("could not expand request directive: {message}"))]
    Directive {
        /// What failed.
        message: String,
    },
}

/// Query lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// The submission task is running.
    Submitted,
    /// A cursor was opened or a multi-statement batch committed.
    Completed,
    /// The submission failed; the message is recorded.
    Errored,
    /// An external cancel tore the query down.
    Cancelled,
}

impl QueryStatus {
    /// Lowercase name, as serialized and sent in `X-Request-Status`.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Submitted => "submitted",
            QueryStatus::Completed => "completed",
            QueryStatus::Errored => "errored",
            QueryStatus::Cancelled => "cancelled",
        }
    }
}

/// What a route handler asks the registry to run.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    /// Caller-supplied or generated id.
    pub id: String,
    /// Connection name.
    pub conn: String,
    /// Optional database override.
    pub database: String,
    /// Raw SQL text (possibly a directive).
    pub text: String,
    /// Bound parameters for builder-generated SELECTs.
    pub params: Vec<Value>,
    /// Row cap; `-1` unlimited, `0` takes [`DEFAULT_SQL_LIMIT`].
    pub limit: i64,
}

/// Generate an id for submissions that did not name one.
pub fn generate_query_id() -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!("sql-{}-{:04x}", Utc::now().timestamp_micros(), suffix)
}

/// Mutable query state, written by the submission task.
#[derive(Debug)]
struct QueryState {
    status: QueryStatus,
    start: i64,
    end: i64,
    err: String,
    affected: i64,
    headers: Vec<String>,
}

/// The caller-facing view of a query, serialized into long-poll bodies.
#[derive(Debug, Clone, Serialize)]
pub struct QuerySnapshot {
    /// Query id.
    pub id: String,
    /// Connection name.
    pub conn: String,
    /// Database override, when any.
    pub database: String,
    /// The (possibly expanded) SQL text.
    pub text: String,
    /// Row cap.
    pub limit: i64,
    /// Lifecycle state.
    pub status: QueryStatus,
    /// Start unix seconds.
    pub start: i64,
    /// End unix seconds; zero while running.
    pub end: i64,
    /// Error message for errored queries.
    pub err: String,
    /// Affected rows; `-1` for cursor results.
    pub affected: i64,
    /// Column headers, once known.
    pub headers: Vec<String>,
}

/// How a finished query answers its waiter.
#[derive(Debug)]
pub enum QueryOutcome {
    /// A cursor is ready to stream.
    Rows(RowStream),
    /// A multi-statement batch committed.
    Affected(i64),
    /// The submission failed.
    Failed(String),
}

/// A submitted query. Shared between the submission task, the registry, and
/// long-poll waiters.
pub struct Query {
    /// Query id.
    pub id: String,
    /// Owning project id; resolved through the global map on demand.
    pub project_id: String,
    /// Connection name.
    pub conn: String,
    /// Database override, when any.
    pub database: String,
    /// Final SQL text after directive expansion.
    pub text: String,
    /// Bound parameters.
    pub params: Vec<Value>,
    /// Row cap.
    pub limit: i64,
    /// Set when a directive rewrote the SQL.
    pub is_generated: bool,

    handle: Arc<dyn DatabaseClient>,
    ctx: CancellationToken,
    state: Mutex<QueryState>,
    stream: Mutex<Option<RowStream>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    last_touch: Mutex<Instant>,
}

impl Query {
    fn new(spec: QuerySpec, project_id: &str, handle: Arc<dyn DatabaseClient>) -> Query {
        let (done_tx, done_rx) = watch::channel(false);
        let limit = if spec.limit == 0 { DEFAULT_SQL_LIMIT } else { spec.limit };
        Query {
            id: spec.id,
            project_id: project_id.to_string(),
            conn: spec.conn,
            database: spec.database,
            text: spec.text,
            params: spec.params,
            limit,
            is_generated: false,
            ctx: handle.root_context().child_token(),
            handle,
            state: Mutex::new(QueryState {
                status: QueryStatus::Submitted,
                start: 0,
                end: 0,
                err: String::new(),
                affected: -1,
                headers: Vec::new(),
            }),
            stream: Mutex::new(None),
            done_tx,
            done_rx,
            last_touch: Mutex::new(Instant::now()),
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> QueryStatus {
        self.state.lock().status
    }

    /// Copy out the serializable view.
    pub fn snapshot(&self) -> QuerySnapshot {
        let state = self.state.lock();
        QuerySnapshot {
            id: self.id.clone(),
            conn: self.conn.clone(),
            database: self.database.clone(),
            text: self.text.clone(),
            limit: self.limit,
            status: state.status,
            start: state.start,
            end: state.end,
            err: state.err.clone(),
            affected: state.affected,
            headers: state.headers.clone(),
        }
    }

    /// Bump the eviction clock.
    pub fn touch(&self) {
        *self.last_touch.lock() = Instant::now();
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.last_touch.lock().elapsed() > ttl
    }

    /// Wait for the done signal, up to `window`. Returns `false` when the
    /// window elapses first.
    pub async fn wait_done(&self, window: Duration) -> bool {
        let mut rx = self.done_rx.clone();
        if *rx.borrow_and_update() {
            return true;
        }
        tokio::select! {
            changed = rx.changed() => changed.is_ok(),
            _ = tokio::time::sleep(window) => false,
        }
    }

    /// Consume the finished query: pull the outcome and drop the registry
    /// entry. Call only after the done signal fired.
    pub fn finish(&self, registry: &QueryRegistry) -> QueryOutcome {
        registry.remove(&self.id);

        let mut state = self.state.lock();
        if state.end == 0 {
            state.end = Utc::now().timestamp();
        }
        if state.status == QueryStatus::Errored || state.status == QueryStatus::Cancelled {
            return QueryOutcome::Failed(state.err.clone());
        }
        drop(state);

        match self.stream.lock().take() {
            Some(rows) => QueryOutcome::Rows(rows),
            None => QueryOutcome::Affected(self.state.lock().affected),
        }
    }

    /// Cancel the execution context and close any open cursor.
    fn cancel(&self) {
        self.ctx.cancel();
        if let Some(stream) = self.stream.lock().take() {
            stream.cancel();
        }
        let mut state = self.state.lock();
        // terminal states never transition further
        if state.status == QueryStatus::Submitted || state.status == QueryStatus::Completed {
            state.status = QueryStatus::Cancelled;
            if state.err.is_empty() {
                state.err = "query cancelled".to_string();
            }
        }
        state.end = Utc::now().timestamp();
    }

    fn set_error(&self, message: String) {
        let mut state = self.state.lock();
        // a cancel that raced the driver error wins
        if state.status == QueryStatus::Submitted {
            state.status = QueryStatus::Errored;
            state.err = message;
        }
        state.end = Utc::now().timestamp();
    }

    /// The submission task body.
    async fn submit(self: Arc<Query>) {
        {
            let mut state = self.state.lock();
            state.status = QueryStatus::Submitted;
            state.start = Utc::now().timestamp();
        }
        tracing::debug!(id = %self.id, conn = %self.conn, "submitting query");

        if let Err(e) = self.execute().await {
            tracing::debug!(id = %self.id, error = %e, "query failed");
            self.set_error(e.to_string());
        }
        // the sole synchronisation edge to long-poll waiters; fired once
        let _ = self.done_tx.send(true);
    }

    async fn execute(&self) -> Result<(), DbError> {
        let statements = split_statements(&self.text);

        if statements.len() == 1 && is_select_shaped(&statements[0]) {
            let opts = StreamOptions { limit: self.limit, params: self.params.clone() };
            let rows = self.handle.stream(self.ctx.clone(), &self.text, opts).await?;
            {
                let mut state = self.state.lock();
                state.headers = rows.columns().iter().map(|c| c.name.clone()).collect();
                state.status = QueryStatus::Completed;
            }
            *self.stream.lock() = Some(rows);
            return Ok(());
        }

        self.handle.begin().await?;
        let result = match self.handle.exec_multi(self.ctx.clone(), &self.text).await {
            Ok(result) => result,
            Err(e) => {
                let _ = self.handle.rollback().await;
                return Err(e);
            }
        };
        if let Err(e) = self.handle.commit().await {
            let _ = self.handle.rollback().await;
            return Err(e);
        }

        let mut state = self.state.lock();
        state.affected = result.rows_affected as i64;
        state.status = QueryStatus::Completed;
        Ok(())
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.id)
            .field("conn", &self.conn)
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct DirectiveRequest {
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    metadata: String,
    #[serde(default)]
    data: BTreeMap<String, serde_json::Value>,
}

/// Expand a `/*--{...}--*/` directive against the handle's template
/// library. Returns the rendered SQL when the text is a directive.
fn expand_directive(
    text: &str,
    handle: &Arc<dyn DatabaseClient>,
) -> Result<Option<String>, QueryError> {
    let trimmed = text.trim();
    if !(trimmed.starts_with("/*--") && trimmed.ends_with("--*/")) {
        return Ok(None);
    }

    let body = trimmed
        .strip_prefix("/*--")
        .and_then(|t| t.strip_suffix("--*/"))
        .unwrap_or_default();
    // YAML parses both YAML and JSON payloads
    let request: DirectiveRequest = serde_yaml::from_str(body)
        .map_err(|e| QueryError::Directive { message: e.to_string() })?;

    let sql = if !request.analysis.is_empty() {
        handle
            .get_analysis(&request.analysis, &request.data)
            .map_err(|e| QueryError::Directive { message: e.to_string() })?
    } else if !request.metadata.is_empty() {
        let template = handle.metadata_template(&request.metadata).ok_or_else(|| {
            QueryError::Directive {
                message: format!("metadata key '{}' not found", request.metadata),
            }
        })?;
        render_template(&template, &request.data)
    } else {
        return Err(QueryError::Directive {
            message: "directive names neither an analysis nor a metadata template".to_string(),
        });
    };

    Ok(Some(sql))
}

/// In-memory catalogue of submitted queries for one project.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    queries: DashMap<String, Arc<Query>>,
}

impl QueryRegistry {
    /// New, empty registry.
    pub fn new() -> QueryRegistry {
        QueryRegistry::default()
    }

    /// Submit a fresh query, or pick up an in-flight one on continuation.
    ///
    /// A continuation that misses fails with [`QueryError::NotFound`]; a
    /// fresh submission with an id already in the registry returns the
    /// existing query untouched, so an id is serviced by exactly one
    /// submission task.
    pub fn submit_or_get(
        &self,
        project_id: &str,
        handle: Arc<dyn DatabaseClient>,
        spec: QuerySpec,
        continued: bool,
    ) -> Result<Arc<Query>, QueryError> {
        if continued {
            let query = self
                .queries
                .get(&spec.id)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or_else(|| QueryError::NotFound { id: spec.id.clone() })?;
            query.touch();
            return Ok(query);
        }

        let mut spec = spec;
        let mut is_generated = false;
        if let Some(sql) = expand_directive(&spec.text, &handle)? {
            spec.text = format!("{}\n\n{}", spec.text, sql);
            is_generated = true;
        }
        spec.text = spec.text.trim_end().trim_end_matches(';').to_string();

        let mut query = Query::new(spec, project_id, handle);
        query.is_generated = is_generated;
        let query = Arc::new(query);

        let entry = self
            .queries
            .entry(query.id.clone())
            .or_insert_with(|| Arc::clone(&query));
        let stored = Arc::clone(entry.value());
        drop(entry);

        if Arc::ptr_eq(&stored, &query) {
            tokio::spawn(Arc::clone(&query).submit());
        }
        Ok(stored)
    }

    /// Look up a live query.
    pub fn get(&self, id: &str) -> Option<Arc<Query>> {
        self.queries.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop a query from the catalogue.
    pub fn remove(&self, id: &str) {
        self.queries.remove(id);
    }

    /// Cancel a query: cancel its context, close its cursor, mark it
    /// cancelled, and drop it from the catalogue.
    pub fn cancel(&self, id: &str) -> Result<(), QueryError> {
        let query = self.get(id).ok_or_else(|| QueryError::NotFound { id: id.to_string() })?;
        query.cancel();
        self.remove(id);
        tracing::info!(id = %id, "query cancelled");
        Ok(())
    }

    /// Evict queries untouched for longer than `ttl`. Returns how many.
    pub fn evict_stale(&self, ttl: Duration) -> usize {
        let before = self.queries.len();
        self.queries.retain(|_, query| !query.expired(ttl));
        before - self.queries.len()
    }

    /// Number of catalogued queries.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Whether the catalogue is empty.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::SqliteClient;

    const WINDOW: Duration = Duration::from_secs(5);

    async fn client() -> Arc<dyn DatabaseClient> {
        let client = SqliteClient::open(":memory:").await.expect("open");
        client
            .exec_multi(
                CancellationToken::new(),
                "create table place (id int primary key, country text); \
                 insert into place values (1, 'USA'), (2, 'Canada')",
            )
            .await
            .expect("seed");
        Arc::new(client)
    }

    fn spec(id: &str, text: &str) -> QuerySpec {
        QuerySpec {
            id: id.to_string(),
            conn: "sqlite_test".to_string(),
            text: text.to_string(),
            ..QuerySpec::default()
        }
    }

    #[tokio::test]
    async fn select_completes_with_rows() {
        let registry = QueryRegistry::new();
        let query = registry
            .submit_or_get("default", client().await, spec("q1", "select id from place order by id"), false)
            .expect("submit");

        assert!(query.wait_done(WINDOW).await);
        assert_eq!(query.status(), QueryStatus::Completed);
        assert_eq!(query.snapshot().headers, vec!["id".to_string()]);

        match query.finish(&registry) {
            QueryOutcome::Rows(mut rows) => {
                let first = rows.next_row().await.unwrap().unwrap();
                assert_eq!(first[0], Value::Int(1));
            }
            other => panic!("expected rows, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn exec_batch_reports_affected() {
        let registry = QueryRegistry::new();
        let query = registry
            .submit_or_get(
                "default",
                client().await,
                spec("q2", "insert into place values (3, 'Brazil'); update place set country = 'BR' where id = 3"),
                false,
            )
            .expect("submit");

        assert!(query.wait_done(WINDOW).await);
        match query.finish(&registry) {
            QueryOutcome::Affected(n) => assert_eq!(n, 2),
            other => panic!("expected affected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn driver_error_is_recorded() {
        let registry = QueryRegistry::new();
        let query = registry
            .submit_or_get("default", client().await, spec("q3", "select * from missing_table"), false)
            .expect("submit");

        assert!(query.wait_done(WINDOW).await);
        assert_eq!(query.status(), QueryStatus::Errored);
        match query.finish(&registry) {
            QueryOutcome::Failed(message) => assert!(!message.is_empty()),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_id_is_serviced_once() {
        let registry = QueryRegistry::new();
        let handle = client().await;
        let first = registry
            .submit_or_get("default", Arc::clone(&handle), spec("dup", "select 1 as a"), false)
            .expect("first");
        let second = registry
            .submit_or_get("default", handle, spec("dup", "select 2 as b"), false)
            .expect("second");

        // the second call sees the existing query unchanged
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.text, "select 1 as a");
    }

    #[tokio::test]
    async fn continuation_finds_in_flight_query() {
        let registry = QueryRegistry::new();
        let handle = client().await;
        let submitted = registry
            .submit_or_get("default", Arc::clone(&handle), spec("cont", "select 1 as a"), false)
            .expect("submit");
        let continued = registry
            .submit_or_get("default", handle, spec("cont", ""), true)
            .expect("continue");
        assert!(Arc::ptr_eq(&submitted, &continued));
    }

    #[tokio::test]
    async fn continuation_with_unknown_id_fails() {
        let registry = QueryRegistry::new();
        let result = registry.submit_or_get("default", client().await, spec("nope", ""), true);
        assert!(matches!(result, Err(QueryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn cancel_removes_and_marks() {
        let registry = QueryRegistry::new();
        let long_query = "WITH RECURSIVE r(i) AS (VALUES(0) UNION ALL SELECT i FROM r LIMIT 100000000) \
                          SELECT i FROM r WHERE i = 1";
        let query = registry
            .submit_or_get("default", client().await, spec("long", long_query), false)
            .expect("submit");

        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.cancel("long").expect("cancel");

        assert_eq!(query.status(), QueryStatus::Cancelled);
        assert!(registry.get("long").is_none());
        // the submitter wakes with a driver error and exits
        assert!(query.wait_done(WINDOW).await);

        // a continuation after cancel fails NotFound
        let result = registry.submit_or_get("default", client().await, spec("long", ""), true);
        assert!(matches!(result, Err(QueryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn trailing_semicolon_is_stripped() {
        let registry = QueryRegistry::new();
        let query = registry
            .submit_or_get("default", client().await, spec("semi", "select 1 as a;"), false)
            .expect("submit");
        assert_eq!(query.text, "select 1 as a");
        assert!(query.wait_done(WINDOW).await);
    }

    #[tokio::test]
    async fn metadata_directive_expands_and_marks_generated() {
        let registry = QueryRegistry::new();
        let text = "/*--{\"metadata\": \"ddl_table\", \"data\": {\"schema\": \"main\", \"table\": \"place\"}}--*/";
        let query = registry
            .submit_or_get("default", client().await, spec("gen", text), false)
            .expect("submit");

        assert!(query.is_generated);
        assert!(query.text.contains("sqlite_master"));
        assert!(query.wait_done(WINDOW).await);
        assert_eq!(query.status(), QueryStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_directive_fails_submission() {
        let registry = QueryRegistry::new();
        let text = "/*--{\"metadata\": \"bogus\"}--*/";
        let result = registry.submit_or_get("default", client().await, spec("bad", text), false);
        assert!(matches!(result, Err(QueryError::Directive { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stale_queries_are_evicted() {
        let registry = QueryRegistry::new();
        let query = registry
            .submit_or_get("default", client().await, spec("old", "select 1 as a"), false)
            .expect("submit");
        assert!(query.wait_done(WINDOW).await);

        assert_eq!(registry.evict_stale(Duration::from_secs(600)), 0);
        assert_eq!(registry.evict_stale(Duration::ZERO), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn zero_limit_takes_default() {
        let registry = QueryRegistry::new();
        let query = registry
            .submit_or_get("default", client().await, spec("lim", "select 1 as a"), false)
            .expect("submit");
        assert_eq!(query.limit, DEFAULT_SQL_LIMIT);
    }
}
