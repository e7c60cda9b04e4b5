// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The daemon-level error taxonomy and its HTTP mapping.
//!
//! Every non-2xx response carries a uniform `{"error": "<message>"}` body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use worker_context::ContextError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("daemon state unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    pub fn status(&self) -> StatusCode {
        match self {
            WorkerError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkerError::AlreadyExists(_) | WorkerError::Conflict(_) => StatusCode::CONFLICT,
            WorkerError::Unauthorized => StatusCode::UNAUTHORIZED,
            WorkerError::Invalid(_) => StatusCode::BAD_REQUEST,
            WorkerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            WorkerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            WorkerError::BackendFailure(_)
            | WorkerError::Transient(_)
            | WorkerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ContextError> for WorkerError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::NotFound(what) => WorkerError::NotFound(what),
            ContextError::AlreadyExists(what) => WorkerError::AlreadyExists(what),
            ContextError::Conflict(what) => WorkerError::Conflict(what),
            ContextError::Storage(e) => WorkerError::Transient(e.to_string()),
            ContextError::Serde(e) => WorkerError::Internal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(e: anyhow::Error) -> Self {
        WorkerError::Internal(e.to_string())
    }
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_status_codes() {
        assert_eq!(WorkerError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(WorkerError::AlreadyExists("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(WorkerError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(WorkerError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(WorkerError::Invalid("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            WorkerError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            WorkerError::BackendFailure("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn context_errors_convert_preserving_kind() {
        let e: WorkerError = ContextError::NotFound("doc".into()).into();
        assert!(matches!(e, WorkerError::NotFound(_)));
        let e: WorkerError = ContextError::AlreadyExists("doc".into()).into();
        assert!(matches!(e, WorkerError::AlreadyExists(_)));
    }
}
