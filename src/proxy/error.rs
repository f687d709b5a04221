use axum::response::{IntoResponse, Response};
use http::StatusCode;
use thiserror::Error;

use super::cache::CacheError;
use super::negotiate::InvalidOrigin;
use super::origin::FetchError;
use super::transform::TransformError;

/// Failures that happen before any response bytes are committed.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    InvalidOrigin(#[from] InvalidOrigin),
    #[error(transparent)]
    OriginFetch(FetchError),
    #[error("origin responded with status {0}")]
    OriginStatus(u16),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    CacheRead(#[from] CacheError),
}

impl From<FetchError> for ProxyError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Status(status) => ProxyError::OriginStatus(status.as_u16()),
            other => ProxyError::OriginFetch(other),
        }
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidOrigin(_) | ProxyError::OriginStatus(_) => StatusCode::BAD_REQUEST,
            ProxyError::OriginFetch(_) | ProxyError::Transform(_) | ProxyError::CacheRead(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short tag used in logs and the access log's `error_reason`.
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::InvalidOrigin(_) => "invalid_origin",
            ProxyError::OriginFetch(_) => "origin_fetch",
            ProxyError::OriginStatus(_) => "origin_status",
            ProxyError::Transform(_) => "transform",
            ProxyError::CacheRead(_) => "cache_read",
        }
    }

    fn body(&self) -> String {
        match self {
            ProxyError::OriginStatus(status) => format!("Unexpected status: {status}"),
            other => other
                .status()
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.body()).into_response()
    }
}
