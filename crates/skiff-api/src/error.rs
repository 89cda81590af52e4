//! Projection of subsystem errors onto HTTP status codes.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use skiff_auth::AuthError;
use skiff_core::ErrorKind;
use skiff_lifecycle::LifecycleError;
use skiff_quota::QuotaError;
use skiff_session::SessionError;
use skiff_snapshot::SnapshotError;
use skiff_state::StateError;
use skiff_substrate::SubstrateError;

use crate::response::ApiResponse;

pub type ApiResult<T> = Result<T, ApiError>;

/// An error on its way to the client: the stable kind plus a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.kind)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::NotRunning | ErrorKind::InUse => StatusCode::CONFLICT,
        ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::WorkloadUnavailable => StatusCode::GONE,
        ErrorKind::SubstrateError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Fatal => StatusCode::BAD_GATEWAY,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

macro_rules! from_subsystem {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for ApiError {
                fn from(e: $ty) -> Self {
                    Self::new(e.kind(), e.to_string())
                }
            }
        )+
    };
}

from_subsystem!(
    AuthError,
    QuotaError,
    StateError,
    SubstrateError,
    LifecycleError,
    SessionError,
    SnapshotError,
);

macro_rules! from_rejection {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for ApiError {
                fn from(rejection: $ty) -> Self {
                    Self::invalid(rejection.body_text())
                }
            }
        )+
    };
}

from_rejection!(
    JsonRejection,
    QueryRejection,
    PathRejection,
    WebSocketUpgradeRejection,
);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.kind {
            ErrorKind::Internal => error!(message = %self.message, "internal error"),
            ErrorKind::Fatal | ErrorKind::SubstrateError => {
                warn!(kind = %self.kind, message = %self.message, "substrate error surfaced to client")
            }
            _ => {}
        }
        (
            self.status(),
            ApiResponse::failure(self.kind, self.message),
        )
            .into_response()
    }
}
