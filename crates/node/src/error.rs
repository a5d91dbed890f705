use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to clients, over HTTP or as event-channel ack failures.
/// Background loops never raise these; they log and carry on.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("duplicate share id: {0}")]
    DuplicateShare(String),

    #[error("share session is full")]
    ShareFull,

    #[error("rate limit exceeded")]
    RateLimited { reset_at_ms: u64 },

    #[error("file size {size} exceeds limit {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    UploadFailed(String),

    #[error("checksum mismatch on chunk {chunk_index}")]
    ChecksumMismatch { chunk_index: u32 },

    #[error("{0}")]
    ServiceUnavailable(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::BadRequest(_) => "BAD_REQUEST",
            RelayError::NotFound(_) => "NOT_FOUND",
            RelayError::Conflict(_) => "CONFLICT",
            RelayError::DuplicateShare(_) => "DUPLICATE_SHARE",
            RelayError::ShareFull => "SHARE_SESSION_FULL",
            RelayError::RateLimited { .. } => "RATE_LIMITED",
            RelayError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            RelayError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            RelayError::UploadFailed(_) => "UPLOAD_FAILED",
            RelayError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            RelayError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::BadRequest(_) | RelayError::ChecksumMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Conflict(_) | RelayError::DuplicateShare(_) | RelayError::ShareFull => {
                StatusCode::CONFLICT
            }
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::FileTooLarge { .. } | RelayError::PayloadTooLarge(_) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            RelayError::UploadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let details = match &self {
            RelayError::RateLimited { reset_at_ms } => Some(json!({ "resetAt": reset_at_ms })),
            RelayError::FileTooLarge { size, limit } => {
                Some(json!({ "size": size, "limit": limit }))
            }
            RelayError::ChecksumMismatch { chunk_index } => {
                Some(json!({ "chunkIndex": chunk_index }))
            }
            _ => None,
        };
        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(details) = details {
            error["details"] = details;
        }
        (self.status(), Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_documented_statuses() {
        assert_eq!(
            RelayError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(RelayError::ShareFull.status(), StatusCode::CONFLICT);
        assert_eq!(RelayError::ShareFull.code(), "SHARE_SESSION_FULL");
        assert_eq!(
            RelayError::FileTooLarge { size: 2, limit: 1 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            RelayError::RateLimited { reset_at_ms: 0 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            RelayError::ServiceUnavailable("store down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
