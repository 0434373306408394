//! Control plane for a one-click deployment platform.
//!
//! Detects a project's framework, provisions an ephemeral sandbox on a
//! pluggable remote provider, streams build/run logs to connected clients,
//! enforces per-tenant and platform-wide limits, and continuously
//! reconciles persisted state against sandbox reality.

pub mod api;
pub mod args;
pub mod autofix;
pub mod broker;
pub mod build;
pub mod config;
pub mod context;
pub mod cost;
pub mod guard;
pub mod identity;
pub mod intent;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod project;
pub mod reconciler;
pub mod sandbox;
pub mod store;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

/// The set of ways a control-plane operation can fail, each mapped to a
/// distinguished HTTP status where applicable (see §7 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    NotFound,
    Conflict,
    PayloadTooLarge,
    PlatformBlocked,
    Sandbox,
    Integration,
    UpstreamUnavailable,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::PlatformBlocked => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Sandbox => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Integration => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
        }
    }
}

/// The crate's error type. Carries a [`ErrorKind`] for HTTP mapping and an
/// opaque user-facing message; any underlying cause is logged, never
/// surfaced to callers.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    autofix: Option<crate::autofix::AutoFixOutcome>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            autofix: None,
        }
    }

    pub fn with_autofix(mut self, outcome: crate::autofix::AutoFixOutcome) -> Self {
        self.autofix = Some(outcome);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Wraps a lower-level error, logging its detail and returning an
    /// opaque message to the caller so internals never leak over HTTP.
    pub fn from_source<E: std::error::Error>(kind: ErrorKind, err: E, context: &str) -> Self {
        tracing::error!(error = %err, context, "internal error");
        Self::new(kind, context.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    autofix: Option<crate::autofix::AutoFixOutcome>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = ApiError {
            error: self.message,
            autofix: self.autofix,
        };
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::from_source(ErrorKind::Integration, err, "persistence operation failed")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
