//! 统一的错误类型及其到 HTTP 状态码的映射。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::{self, ErrorKind};
use tracing::warn;

#[derive(Debug)]
pub enum ApiError {
    NotFound,
    Forbidden,
    Internal(String),
    RangeNotSatisfiable(u64),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }

    /// 将任意可显示的错误包装为 500。
    pub fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal(err.to_string())
    }
}

/// Plain status text response, e.g. `404 Not Found` → `Not Found`.
pub fn status_response(status: StatusCode) -> Response {
    (status, status.canonical_reason().unwrap_or_default()).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Internal(ref msg) => {
                warn!(error = msg.as_str(), "request failed");
                status_response(self.status())
            }
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                let status = StatusCode::RANGE_NOT_SATISFIABLE;
                (status, headers, status.canonical_reason().unwrap_or_default()).into_response()
            }
            ApiError::NotFound | ApiError::Forbidden => status_response(self.status()),
        }
    }
}

impl From<io::Error> for ApiError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => ApiError::NotFound,
            ErrorKind::PermissionDenied => ApiError::Forbidden,
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
