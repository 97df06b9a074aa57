//! The JSON error envelope returned to HTTP clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub struct ApiError {
    pub status_code: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

impl From<crate::error::ApiError> for ApiError {
    fn from(err: crate::error::ApiError) -> Self {
        match &err {
            crate::error::ApiError::UnknownStatus(_)
            | crate::error::ApiError::InvalidLatencyLimit(_)
            | crate::error::ApiError::InvalidBandwidthLimit(_) => Self::bad_request(err.to_string()),
            crate::error::ApiError::Internal(_) => Self::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = axum::Json(json!({
            "code": self.status_code.as_u16(),
            "success": false,
            "message": self.message,
        }));
        (self.status_code, body).into_response()
    }
}
