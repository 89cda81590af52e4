//! Extractors whose rejections use the error envelope.
//!
//! axum's own `Json`, `Query` and `Path` reject with plain-text bodies.
//! These wrappers deserialize the same way but reject with [`ApiError`],
//! so a malformed body or a missing parameter still carries a kind tag.

use axum::extract::{FromRequest, FromRequestParts};

use crate::error::ApiError;

#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct Json<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct Query<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct Path<T>(pub T);
