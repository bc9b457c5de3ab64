use crate::household_store::StoreError;
use crate::photo_upload::PhotoError;
use crate::transcoder::TranscodeError;
use crate::validation::{FieldError, ValidationErrors};
use axum::extract::rejection::JsonRejection;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

const RESIZE_HINT: &str = "Try to resize the image or reduce its quality before upload";

/// Errors returned by the HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(ValidationErrors),

    #[error("{0}")]
    BadRequest(String),

    #[error("Resource not found with id of {0}")]
    NotFound(String),

    #[error(transparent)]
    Transcode(TranscodeError),

    #[error("Photo upload failed")]
    Upload(#[source] anyhow::Error),

    #[error("Server Error")]
    Internal(#[source] anyhow::Error),
}

/// Failure envelope
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Transcode(_) | ApiError::Upload(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to return to clients
    fn public_message(&self) -> String {
        match self {
            ApiError::Transcode(e @ TranscodeError::PixelLimit { .. }) => e.to_string(),
            ApiError::Transcode(_) => format!("Image could not be processed. {RESIZE_HINT}"),
            other => other.to_string(),
        }
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        ApiError::Validation(errors)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            duplicate @ StoreError::DuplicateSlug(_) => ApiError::BadRequest(duplicate.to_string()),
            StoreError::Database(db) => ApiError::Internal(db.into()),
        }
    }
}

impl From<PhotoError> for ApiError {
    fn from(e: PhotoError) -> Self {
        match e {
            PhotoError::Validation(message) => ApiError::BadRequest(message),
            PhotoError::Transcode(e) => ApiError::Transcode(e),
            PhotoError::Upload(e) => ApiError::Upload(e),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            error!(error = ?self, "Request failed");
        }

        let errors = match &self {
            ApiError::Validation(errors) => Some(errors.errors().to_vec()),
            _ => None,
        };

        let body = ErrorBody {
            success: false,
            error: self.public_message(),
            errors,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(ValidationErrors::single("familyName", "Family name is required")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::DuplicateSlug("smith-a".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("abc".to_string()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(PhotoError::Upload(anyhow::anyhow!("boom"))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ApiError::from(StoreError::DuplicateSlug("smith-a".to_string())).to_string(),
            "Duplicate field value entered"
        );
        assert_eq!(
            ApiError::NotFound("abc".to_string()).to_string(),
            "Resource not found with id of abc"
        );
    }

    #[test]
    fn test_provider_detail_is_not_exposed() {
        let err = ApiError::from(PhotoError::Upload(anyhow::anyhow!("AccessDenied: secret-bucket")));
        assert_eq!(err.public_message(), "Photo upload failed");
    }

    #[test]
    fn test_transcode_message_carries_hint() {
        let pixel = ApiError::Transcode(TranscodeError::PixelLimit {
            pixels: 10,
            limit: 5,
        });
        assert!(pixel.public_message().contains(RESIZE_HINT));

        let task = ApiError::Transcode(TranscodeError::Task("panicked".to_string()));
        assert!(task.public_message().contains(RESIZE_HINT));
        assert!(!task.public_message().contains("panicked"));
    }

    #[test]
    fn test_validation_body_lists_fields() {
        let mut errors = ValidationErrors::new();
        errors.add("familyName", "Family name is required");
        errors.add("address", "Address is required");

        let err = ApiError::from(errors);
        let body = ErrorBody {
            success: false,
            error: err.public_message(),
            errors: match &err {
                ApiError::Validation(e) => Some(e.errors().to_vec()),
                _ => None,
            },
        };
        let json = serde_json::to_value(body).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Validation failed");
        assert_eq!(json["errors"][1]["path"], "address");
    }
}
