//! API key extraction middleware.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use skiff_auth::AuthError;

use crate::ApiState;
use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Key material from `Authorization: Bearer <key>` or `X-API-Key: <key>`.
pub fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    bearer
        .or_else(|| {
            headers
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        })
        .filter(|key| !key.is_empty())
}

/// Resolve the caller to a [`skiff_auth::Principal`] and stash it in the
/// request extensions. Scope checks happen in the handlers.
pub async fn require_key(State(state): State<ApiState>, mut req: Request, next: Next) -> Response {
    let principal = match presented_key(req.headers()) {
        Some(key) => state.auth.validate(key),
        None => Err(AuthError::Unauthorized),
    };
    match principal {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
