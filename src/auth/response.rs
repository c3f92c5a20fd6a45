use super::error::AuthError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// JSON envelope every non-redirect endpoint answers with
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub status_code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T, path: &str) -> Self {
        Self {
            success: true,
            status_code: StatusCode::OK.as_u16(),
            message: message.into(),
            data: Some(data),
            error: None,
            timestamp: now(),
            path: path.to_string(),
        }
    }
}

impl ApiResponse<()> {
    pub fn from_error(err: &AuthError, path: &str) -> Self {
        let message = err.public_message();
        Self {
            success: false,
            status_code: err.status().as_u16(),
            message: message.clone(),
            data: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message,
                details: None,
            }),
            timestamp: now(),
            path: path.to_string(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);
        (status, Json(self)).into_response()
    }
}

/// Logs server-side failures with full detail; the client only sees the public message
pub fn error_response(err: &AuthError, path: &str) -> Response {
    if err.status().is_server_error() {
        tracing::error!(code = err.code(), path, "request failed: {:#}", err);
    } else {
        tracing::debug!(code = err.code(), path, "request rejected: {}", err);
    }
    ApiResponse::from_error(err, path).into_response()
}
