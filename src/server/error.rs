//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::Error;

/// Error returned by the HTTP handlers. Rendered as `{"error": message, "kind": kind}`.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ApiError(#[from] pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::UnknownOrchestration(_) | Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(target: "agentflow::server", error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, axum::Json(body)).into_response()
    }
}
