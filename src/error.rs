use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Errors surfaced by `/api/process`, each mapped to a status code and a
/// caller-facing message
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(&'static str),

    #[error("Bad request")]
    MalformedRequest,

    #[error("File too large")]
    PayloadTooLarge,

    #[error("Image processing failed: {0}")]
    ImageProcessing(String),

    #[error("Unable to reduce image to required size while maintaining quality")]
    ImageTooLarge,

    /// The cause is logged, never returned to the caller
    #[error("Asset upload failed")]
    AssetUpload(#[source] anyhow::Error),

    #[error("VILA API request failed: {0}")]
    Inference(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Validation(_)
            | RelayError::MalformedRequest
            | RelayError::ImageProcessing(_)
            | RelayError::ImageTooLarge
            | RelayError::AssetUpload(_)
            | RelayError::Inference(_) => StatusCode::BAD_REQUEST,
            RelayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(error: std::io::Error) -> Self {
        RelayError::Internal(error.into())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match &self {
            RelayError::AssetUpload(cause) => error!(?cause, "Asset upload failed"),
            RelayError::Internal(cause) => error!(?cause, "Unexpected error"),
            _ => {}
        }

        let status = self.status_code();
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_domain_errors_are_bad_requests() {
        for err in [
            RelayError::Validation("Prompt is required"),
            RelayError::ImageTooLarge,
            RelayError::ImageProcessing("bad header".into()),
            RelayError::AssetUpload(anyhow!("403 from storage")),
            RelayError::Inference("HTTP status server error (503 Service Unavailable)".into()),
        ] {
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST, "{err}");
        }
        assert_eq!(
            RelayError::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_causes_are_not_exposed() {
        let err = RelayError::AssetUpload(anyhow!("secret-bucket rejected signature"));
        assert_eq!(err.to_string(), "Asset upload failed");

        let err = RelayError::from(anyhow!("disk on fire"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Internal server error");
    }
}
