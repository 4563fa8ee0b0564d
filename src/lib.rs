//! sqlgate: a REST API over any SQL database.
//!
//! A caller authenticates with a bearer token, the token maps to roles,
//! roles grant read/write/SQL privileges over tables per connection, and
//! the gateway translates REST verbs into database operations: metadata
//! introspection, parameterised SELECT, ad-hoc SQL with long-poll
//! continuation and cancellation, and bulk ingest streamed from the
//! request body.
//!
//! The crate splits along the request path:
//!
//! - [`auth`] — grants, roles, and permission flattening
//! - [`config`] — server configuration and the credential store
//! - [`db`] — the `DatabaseClient` seam, with a bundled SQLite driver
//! - [`state`] — projects, connection registry, token store, query registry
//! - [`server`] — HTTP routing, request context, response negotiation
//! - [`error`] — the HTTP error taxonomy

#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use server::Server;
pub use state::AppState;
