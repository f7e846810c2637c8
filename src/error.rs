use axum::http::header::CONTENT_RANGE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::pool::ClientId;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("range not satisfiable for object of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("no session available")]
    NoSessionAvailable,

    #[error("session {0} is already registered")]
    DuplicateSession(ClientId),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("ingestion failed: {0}")]
    IngestionFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::NoSessionAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::IngestionFailed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::UpstreamUnavailable(_)
            | GatewayError::DuplicateSession(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Store descriptors and upstream details stay in
    /// the logs.
    fn public_message(&self) -> String {
        match self {
            GatewayError::NotFound(_) => "File not found.".into(),
            GatewayError::RangeNotSatisfiable { .. } => "Range not satisfiable.".into(),
            GatewayError::NoSessionAvailable => "No available clients.".into(),
            GatewayError::IngestionFailed(_) => "Ingestion failed.".into(),
            GatewayError::BadRequest(msg) => format!("Bad request: {msg}"),
            GatewayError::Unauthorized => "Unauthorized.".into(),
            GatewayError::UpstreamUnavailable(_)
            | GatewayError::DuplicateSession(_)
            | GatewayError::Internal(_) => "Internal streaming error.".into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut resp = (self.status(), self.public_message()).into_response();
        if let GatewayError::RangeNotSatisfiable { size } = self {
            if let Ok(v) = format!("bytes */{size}").parse() {
                resp.headers_mut().insert(CONTENT_RANGE, v);
            }
        }
        resp
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            GatewayError::RangeNotSatisfiable { size: 10 }.status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            GatewayError::NoSessionAvailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UpstreamUnavailable("flood wait".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn range_error_carries_unsatisfied_content_range() {
        let resp = GatewayError::RangeNotSatisfiable { size: 4096 }.into_response();
        assert_eq!(resp.headers().get(CONTENT_RANGE).unwrap(), "bytes */4096");
    }

    #[test]
    fn upstream_details_are_not_exposed() {
        let err = GatewayError::UpstreamUnavailable("bucket-secret/000042".into());
        assert!(!err.public_message().contains("000042"));
    }
}
