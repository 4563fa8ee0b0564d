//! The HTTP server: routing, middleware, and lifecycle.

pub mod request;
pub mod response;
mod routes_connection;
mod routes_query;
mod routes_table;

use anyhow::{Context, Result};
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::state::AppState;

/// The gateway server: one listener, one state, one shutdown token.
pub struct Server {
    state: AppState,
    shutdown: CancellationToken,
}

impl Server {
    /// Build a server around a configuration.
    pub fn new(config: ServerConfig) -> Server {
        Server { state: AppState::new(config), shutdown: CancellationToken::new() }
    }

    /// The shared state, for embedding and tests.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// A token that stops the listener when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The complete router with middleware applied.
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind and serve until shutdown, then close all pooled handles.
    pub async fn serve(&self) -> Result<()> {
        let port = self.state.config().port;
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("could not bind port {port}"))?;
        tracing::info!(port, "serving HTTP");

        let janitor = self.state.spawn_janitor(self.shutdown.clone());

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("server failed")?;

        janitor.abort();
        self.close().await;
        Ok(())
    }

    /// Close every pooled database handle in every project.
    pub async fn close(&self) {
        self.state.close_all().await;
        tracing::info!("closed all database handles");
    }
}

/// Assemble routes and middleware over the given state.
pub fn build_router(state: AppState) -> Router {
    let exposed = tower_http::cors::ExposeHeaders::list([
        HeaderName::from_static("x-request-id"),
        HeaderName::from_static("x-request-columns"),
        HeaderName::from_static("x-request-status"),
        HeaderName::from_static("x-request-continue"),
        HeaderName::from_static("x-project-id"),
    ]);
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(exposed);

    Router::new()
        .route("/.status", get(routes_connection::get_status))
        .route("/.connections", get(routes_connection::get_connections))
        .route("/{connection}/.close", post(routes_connection::post_connection_close))
        .route("/{connection}/.databases", get(routes_connection::get_connection_databases))
        .route("/{connection}/.schemas", get(routes_connection::get_connection_schemas))
        .route("/{connection}/.tables", get(routes_connection::get_connection_tables))
        .route("/{connection}/.columns", get(routes_connection::get_connection_columns))
        .route("/{connection}/.sql", post(routes_query::post_connection_sql))
        .route("/{connection}/.sql/{id}", post(routes_query::post_connection_sql_id))
        .route("/{connection}/.cancel/{id}", post(routes_query::post_connection_cancel))
        .route("/{connection}/{schema}/.tables", get(routes_connection::get_schema_tables))
        .route("/{connection}/{schema}/.columns", get(routes_connection::get_schema_columns))
        .route(
            "/{connection}/{schema}/{table}/.columns",
            get(routes_table::get_table_columns),
        )
        .route(
            "/{connection}/{schema}/{table}/.indexes",
            get(routes_table::get_table_indexes),
        )
        .route("/{connection}/{schema}/{table}/.keys", get(routes_table::get_table_keys))
        .route(
            "/{connection}/{schema}/{table}",
            get(routes_table::get_table_select)
                .post(routes_table::post_table_insert)
                .put(routes_table::put_table_upsert)
                .patch(routes_table::patch_table_update),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(cors)
        .with_state(state)
}
