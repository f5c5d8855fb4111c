//! API error type.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use keel_data::StoreError;
use keel_execution::sync::ReconcileError;
use serde::Serialize;
use thiserror::Error;

/// Errors returned by the handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("position store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Reconcile(ReconcileError::ExchangeUnavailable { .. }) => StatusCode::BAD_GATEWAY,
            Self::Reconcile(ReconcileError::ServiceStopped) | Self::Store(StoreError::Closed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Reconcile(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::BadRequest("mode".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Reconcile(ReconcileError::ExchangeUnavailable {
                attempts: 3,
                last_error: "timeout".to_string(),
            })
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::Reconcile(ReconcileError::ServiceStopped).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Store(StoreError::Closed).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
