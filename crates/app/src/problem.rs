use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::service::ServiceError;

/// RFC 7807 style error body. The `type` field is the stable
/// machine-readable kind; `detail` is the human-readable message.
#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    /// Maps the service error taxonomy onto HTTP problem responses.
    ///
    /// Internal failures are logged here with full context and surfaced with
    /// a generic detail only.
    pub fn from_service_error(err: &ServiceError) -> Self {
        match err {
            ServiceError::InvalidArgument(_) => {
                Self::new(StatusCode::BAD_REQUEST, err.kind(), err.to_string())
            }
            ServiceError::Unavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.kind(), err.to_string())
            }
            ServiceError::Internal(detail) => {
                error!(stage = "service", %detail, "internal error during account creation");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.kind(),
                    "an internal error occurred",
                )
            }
        }
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
