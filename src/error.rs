use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::resolver::ResolverError;

/// Seconds suggested to the client after the best-format download gives up.
pub const DOWNLOAD_RETRY_AFTER_SECONDS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Upstream(#[source] ResolverError),

    #[error("{details}")]
    DownloadFailed {
        details: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Failed to get proxy")]
    ProxyUnavailable,

    #[error("server is shutting down")]
    Cancelled,
}

impl ServiceError {
    pub fn download_failed(details: impl Into<String>) -> Self {
        Self::DownloadFailed {
            details: details.into(),
            retry_after_seconds: None,
        }
    }
}

impl From<ResolverError> for ServiceError {
    fn from(error: ResolverError) -> Self {
        match error {
            ResolverError::Cancelled => Self::Cancelled,
            other => Self::Upstream(other),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<String>,
    pub code: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
            code: Some("BAD_REQUEST"),
            retry_after_seconds: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: None,
            code: None,
            retry_after_seconds: None,
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::BadRequest(message) => Self::bad_request(message),
            ServiceError::Upstream(source) => Self::internal("Internal server error")
                .with_details(source.to_string())
                .with_code("UPSTREAM_ERROR"),
            ServiceError::DownloadFailed {
                details,
                retry_after_seconds,
            } => {
                let mut api_error = Self::internal("Error downloading video")
                    .with_details(details)
                    .with_code("DOWNLOAD_FAILED");
                api_error.retry_after_seconds = retry_after_seconds;
                api_error
            }
            ServiceError::ProxyUnavailable => {
                Self::internal("Failed to get proxy").with_code("PROXY_UNAVAILABLE")
            }
            ServiceError::Cancelled => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "Server is shutting down".to_string(),
                details: None,
                code: Some("SHUTTING_DOWN"),
                retry_after_seconds: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            details: self.details,
            code: self.code,
            retry_after: self
                .retry_after_seconds
                .map(|seconds| format!("{seconds} seconds")),
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
