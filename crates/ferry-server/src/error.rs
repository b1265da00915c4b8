//! API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ferry_core::ErrorCode;
use ferry_store::StoreError;
use tracing::error;

use crate::api::{Envelope, TransferType};

/// Errors returned by API handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Neither a stored transfer nor a live room holds the code
    #[error("no transfer exists for this code")]
    UnknownCode,

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(StoreError::NotFound | StoreError::Expired) | ApiError::UnknownCode => {
                StatusCode::NOT_FOUND
            }
            ApiError::Store(StoreError::Exhausted) => StatusCode::FORBIDDEN,
            ApiError::Store(StoreError::AlreadyExists) => StatusCode::CONFLICT,
            ApiError::Store(StoreError::InvalidUpload(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::Store(e) => ErrorCode::from(e),
            ApiError::UnknownCode => ErrorCode::NotFound,
            ApiError::BadRequest(_) => ErrorCode::BadRequest,
            ApiError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Transfer type reported alongside the error, when it says something
    /// about the code
    pub fn transfer_type(&self) -> Option<TransferType> {
        match self {
            ApiError::Store(StoreError::Expired) => Some(TransferType::Expired),
            ApiError::Store(StoreError::Exhausted) => Some(TransferType::Exhausted),
            ApiError::UnknownCode => Some(TransferType::Unknown),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        // Internal details stay in the log
        let message = match self.code() {
            ErrorCode::Internal => ErrorCode::Internal.describe().to_string(),
            _ => self.to_string(),
        };

        let body = Envelope::<()> {
            success: false,
            message: Some(message),
            transfer_type: self.transfer_type(),
            error: Some(self.code()),
            ..Envelope::default()
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::Store(StoreError::Exhausted).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::Store(StoreError::Expired).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::UnknownCode.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::BadRequest("no type".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Store(StoreError::LockPoisoned).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_transfer_types() {
        assert_eq!(
            ApiError::Store(StoreError::Expired).transfer_type(),
            Some(TransferType::Expired)
        );
        assert_eq!(ApiError::UnknownCode.transfer_type(), Some(TransferType::Unknown));
        assert_eq!(ApiError::Internal("x".into()).transfer_type(), None);
    }
}
