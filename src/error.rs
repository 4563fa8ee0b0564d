//! Error taxonomy for the HTTP surface.
//!
//! Every handler funnels failures into [`ApiError`], which maps onto an HTTP
//! status and a JSON body of the shape `{"error": "<safe message>"}`. The
//! full error chain is logged server-side before the response is built, so
//! the client only ever sees the sanitized message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use snafu::Snafu;

use crate::db::DbError;

/// Errors surfaced to HTTP clients.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    /// Missing or invalid request fields, unparseable directive bodies,
    /// unknown analysis/metadata names.
    #[snafu(display("{message}"))]
    BadInput {
        /// What was wrong with the request.
        message: String,
    },

    /// Empty role set, no access to the connection, or a failed
    /// read/write/sql permission check.
    #[snafu(display("{message}"))]
    Forbidden {
        /// Which check failed.
        message: String,
    },

    /// Unknown connection, or unknown query id on a continuation.
    #[snafu(display("{message}"))]
    NotFound {
        /// What was not found.
        message: String,
    },

    /// Reserved surface (upsert, patch).
    #[snafu(display("not implemented"))]
    NotImplemented,

    /// Driver errors, stream construction failures, transaction failures.
    #[snafu(display("{message}"))]
    Internal {
        /// Context for the failure.
        message: String,
        /// The underlying driver error, when one exists.
        #[snafu(source(from(DbError, Box::new)))]
        source: Box<DbError>,
    },

    /// Internal failure with no driver error attached.
    #[snafu(display("{message}"))]
    Server {
        /// Context for the failure.
        message: String,
    },
}

impl ApiError {
    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadInput { .. } => StatusCode::BAD_REQUEST,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ApiError::Internal { .. } | ApiError::Server { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Shorthand for a [`ApiError::BadInput`].
    pub fn bad_input(message: impl Into<String>) -> Self {
        ApiError::BadInput { message: message.into() }
    }

    /// Shorthand for a [`ApiError::Forbidden`].
    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden { message: message.into() }
    }

    /// Shorthand for a [`ApiError::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound { message: message.into() }
    }

    /// Shorthand for a server-side failure without a driver source.
    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Server { message: message.into() }
    }

    /// Wrap a driver error with request-level context.
    pub fn driver(message: impl Into<String>, source: DbError) -> Self {
        ApiError::Internal { message: message.into(), source: Box::new(source) }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "request rejected");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

impl From<crate::state::ProjectError> for ApiError {
    fn from(err: crate::state::ProjectError) -> Self {
        use crate::state::ProjectError;
        match err {
            ProjectError::UnknownConnection { name } => {
                ApiError::not_found(format!("could not find connection {name}"))
            }
            ProjectError::Connect { name, source } => {
                ApiError::driver(format!("could not connect to {name}"), source)
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<crate::state::QueryError> for ApiError {
    fn from(err: crate::state::QueryError) -> Self {
        use crate::state::QueryError;
        match err {
            QueryError::NotFound { id } => {
                ApiError::not_found(format!("could not find query {id}"))
            }
            QueryError::Directive { .. } => ApiError::bad_input(err.to_string()),
        }
    }
}

/// Result alias used by route handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::bad_input("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::forbidden("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::NotImplemented.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(ApiError::internal("x").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn message_is_safe_for_clients() {
        let err = ApiError::forbidden("Invalid token or forbidden");
        assert_eq!(err.to_string(), "Invalid token or forbidden");
    }
}
