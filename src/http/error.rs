//! Error stage of the request pipeline.
//!
//! Every handler returns `Result<_, AppError>`. Client mistakes become 4xx
//! responses carrying the reason; everything else becomes a generic 500 whose
//! detail only reaches the server log. Panics are caught by
//! [`handle_panic`] and reported the same way.

use std::any::Any;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::http::directives::DirectiveError;

/// Body of every 500 response.
pub const SERVER_ERROR_BODY: &str = "Something broke!";

/// Error type shared by all route handlers.
#[derive(Debug, Error)]
pub enum AppError {
    /// The request itself is unacceptable (path escape, bad parameter).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A behavior directive could not be parsed.
    #[error(transparent)]
    Directive(#[from] DirectiveError),

    /// Filesystem failure other than "not found".
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else that should never happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) | AppError::Directive(_) => StatusCode::BAD_REQUEST,
            AppError::Io(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, detail = ?self, "Error during route");
            (status, SERVER_ERROR_BODY).into_response()
        } else {
            tracing::debug!(error = %self, "Rejected request");
            (status, self.to_string()).into_response()
        }
    }
}

/// Turn a handler panic into the same generic 500 as any other failure.
pub fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    };
    tracing::error!(panic = %detail, "Handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR_BODY).into_response()
}
