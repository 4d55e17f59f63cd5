//! 统一的 API 错误类型与 JSON 错误响应。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde_json::json;
use std::io::ErrorKind;
use tracing::error;

use crate::ledger::LedgerError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::PayloadTooLarge(msg) => msg,
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                "internal server error".to_string()
            }
        };
        (status, JsonResponse(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InvalidName => ApiError::BadRequest("Invalid firmware filename".into()),
            StoreError::NotFound(_) => ApiError::NotFound("Firmware not found".into()),
            StoreError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("Firmware not found".into()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(error: LedgerError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn error_body_is_json() {
        let response = ApiError::NotFound("Firmware not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(value["error"], "Firmware not found");
    }

    #[tokio::test]
    async fn internal_error_hides_details() {
        let response = ApiError::Internal("disk exploded at /srv".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(value["error"], "internal server error");
    }

    #[test]
    fn store_errors_map_to_status() {
        let missing = ApiError::from(StoreError::NotFound("a.bin".into()));
        assert!(matches!(missing, ApiError::NotFound(_)));
        let invalid = ApiError::from(StoreError::InvalidName);
        assert!(matches!(invalid, ApiError::BadRequest(_)));
        let denied = ApiError::from(StoreError::Io(io::Error::from(
            io::ErrorKind::PermissionDenied,
        )));
        assert!(matches!(denied, ApiError::Internal(_)));
    }
}
