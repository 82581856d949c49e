use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::api;
use crate::bridge::GenerationError;

/// Everything a client can get back instead of a result.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("The request body is not valid JSON.")]
    InvalidJson,
    #[error("The `messages` parameter must be a non-empty list of objects with string `role` and `content`.")]
    InvalidMessages,
    #[error("This endpoint requires a Content-Type of application/json.")]
    UnsupportedMediaType,
    #[error("The requested resource was not found.")]
    NotFound,
    #[error("The requested method is not allowed.")]
    MethodNotAllowed,
    #[error("An unexpected error occurred. Try again later.")]
    Internal(#[from] GenerationError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidJson | ApiError::InvalidMessages => {
                StatusCode::BAD_REQUEST
            }
            ApiError::UnsupportedMediaType => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidJson | ApiError::InvalidMessages => {
                "invalid_request"
            }
            ApiError::UnsupportedMediaType => "request_unsupported_media",
            ApiError::NotFound => "resource_missing",
            ApiError::MethodNotAllowed => "request_unsupported_method",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// Server-class failures may be transient; client-class ones never
    /// succeed without changing the request.
    pub fn is_retryable(&self) -> bool {
        self.status().is_server_error()
    }

    fn kind(&self) -> &'static str {
        if self.is_retryable() {
            "api_error"
        } else {
            "invalid_request_error"
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Internal(cause) => error!(%cause, "Request failed."),
            _ => debug!(code = self.code(), "Rejected request."),
        }
        let body = api::ErrorBody {
            error: api::ErrorDetail {
                code: self.code(),
                message: self.to_string(),
                kind: self.kind(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_and_server_errors_are_distinguishable() {
        let client = [
            ApiError::InvalidJson,
            ApiError::InvalidMessages,
            ApiError::UnsupportedMediaType,
            ApiError::NotFound,
            ApiError::MethodNotAllowed,
        ];
        for err in client {
            assert!(err.status().is_client_error());
            assert!(!err.is_retryable());
            assert_eq!(err.kind(), "invalid_request_error");
        }
        let server = ApiError::from(GenerationError::Failed("oom".to_owned()));
        assert_eq!(server.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(server.is_retryable());
        assert_eq!(server.code(), "internal_error");
        // The cause is logged, never sent to the client.
        assert!(!server.to_string().contains("oom"));
    }
}
