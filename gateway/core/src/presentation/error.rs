// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! HTTP-facing error taxonomy.
//!
//! Every error body is `{"error": <message>, "request_id": <id>}`.

use axum::http::header::{RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::application::auth_gate::AuthFailure;
use crate::application::session_admin::SessionAdminError;
use crate::infrastructure::upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found")]
    NotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("{0}")]
    BadRequest(String),

    #[error("CORS origin not allowed")]
    CorsDenied,

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Too many websocket connections")]
    TooManyConnections,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::Forbidden | RelayError::CorsDenied => StatusCode::FORBIDDEN,
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::RateLimited { .. } | RelayError::TooManyConnections => {
                StatusCode::TOO_MANY_REQUESTS
            }
            RelayError::Upstream(e) => e.status_code(),
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn with_request_id(self, request_id: impl Into<String>) -> ApiError {
        ApiError {
            error: self,
            request_id: request_id.into(),
        }
    }
}

impl From<AuthFailure> for RelayError {
    fn from(failure: AuthFailure) -> Self {
        if failure.status_code() == StatusCode::FORBIDDEN {
            RelayError::Forbidden
        } else {
            RelayError::Unauthorized
        }
    }
}

impl From<SessionAdminError> for RelayError {
    fn from(err: SessionAdminError) -> Self {
        match err {
            SessionAdminError::Store(e) => RelayError::Internal(e.to_string()),
            other => RelayError::BadRequest(other.to_string()),
        }
    }
}

/// A [`RelayError`] bound to the request it answers.
#[derive(Debug)]
pub struct ApiError {
    pub error: RelayError,
    pub request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let body = Json(json!({
            "error": self.error.to_string(),
            "request_id": self.request_id,
        }));
        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        match self.error {
            RelayError::Unauthorized => {
                headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            RelayError::RateLimited { retry_after_secs } => {
                headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs.max(1)));
            }
            _ => {}
        }
        response
    }
}
