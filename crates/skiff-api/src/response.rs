//! Response envelope shared by every JSON endpoint.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use skiff_core::ErrorKind;

/// `{"success": true, "data": ..}` or `{"success": false, "error": {..}}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    pub fn created(data: T) -> Response {
        (StatusCode::CREATED, Self::ok(data)).into_response()
    }
}

impl ApiResponse<()> {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind,
                message: message.into(),
            }),
        })
    }
}
