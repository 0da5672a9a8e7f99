use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::verifier::VerifyFailure;

/// The main error type for the engine.
///
/// Every variant maps to a stable machine-readable error code so clients can
/// distinguish "try again with different input" from "try again later" from
/// "contact support".
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The store rejected the submitted proof of purchase, or verification
    /// could not be attempted. Carries the normalized failure reason.
    #[error("receipt validation failed: {0}")]
    ReceiptRejected(VerifyFailure),

    /// A renewal-family webhook arrived without a product id.
    #[error("webhook payload is missing product_id")]
    MissingProductId,

    /// The request body failed validation.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No API key was supplied on a tenant-scoped route.
    #[error("missing API key")]
    MissingApiKey,

    /// The supplied API key does not resolve to a tenant.
    #[error("invalid API key")]
    InvalidApiKey,

    /// Admin credentials were wrong or absent.
    #[error("unauthorized")]
    Unauthorized,

    /// The admin surface is enabled but no password is configured.
    #[error("basic auth is not configured")]
    AdminAuthNotConfigured,

    #[error("not found: {0}")]
    NotFound(String),

    /// Route exists in the SDK surface but is not implemented here.
    #[error("endpoint not implemented")]
    NotImplemented,

    #[error("storage error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// JSON body for error responses: `{"error": code, "details": ...}`.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl EngineError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            // A missing shared secret or unreadable service-account key is a
            // server misconfiguration, not a client-attributable rejection.
            Self::ReceiptRejected(reason) if reason.is_configuration() => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ReceiptRejected(_) | Self::MissingProductId | Self::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::MissingApiKey | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidApiKey => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::AdminAuthNotConfigured
            | Self::Store(_)
            | Self::Internal(_)
            | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ReceiptRejected(reason) if reason.is_configuration() => "store_not_configured",
            Self::ReceiptRejected(_) => "receipt_validation_failed",
            Self::MissingProductId => "missing_product_id",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::MissingApiKey => "missing_api_key",
            Self::InvalidApiKey => "invalid_api_key",
            Self::Unauthorized => "unauthorized",
            Self::AdminAuthNotConfigured => "basic_auth_not_configured",
            Self::NotFound(_) => "not_found",
            Self::NotImplemented => "not_implemented",
            Self::Store(_) => "storage_error",
            Self::Internal(_) | Self::Anyhow(_) => "internal_error",
        }
    }

    /// Details that are safe to expose to clients.
    ///
    /// Client-attributable errors carry their message; server errors are
    /// logged in full but surfaced without internals.
    fn safe_details(&self) -> Option<String> {
        match self {
            Self::ReceiptRejected(reason) if !reason.is_configuration() => {
                Some(reason.to_string())
            }
            Self::InvalidPayload(msg) => Some(msg.clone()),
            Self::NotFound(msg) => Some(msg.clone()),
            Self::NotImplemented => {
                Some("Endpoint not implemented yet. See README for planned coverage.".to_string())
            }
            _ => None,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }

        let body = Json(ErrorBody {
            error: self.code(),
            details: self.safe_details(),
        });

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            EngineError::InvalidPayload(format!("JSON error: {err}"))
        } else {
            EngineError::Internal(format!("JSON serialization error: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_rejection_is_client_error() {
        let err = EngineError::ReceiptRejected(VerifyFailure::StoreRejected { status: 21003 });
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "receipt_validation_failed");
        assert!(err.safe_details().unwrap().contains("21003"));
    }

    #[test]
    fn missing_credentials_is_server_error() {
        let err = EngineError::ReceiptRejected(VerifyFailure::MissingSharedSecret);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "store_not_configured");
        // Configuration details stay server-side
        assert!(err.safe_details().is_none());
    }

    #[test]
    fn auth_errors_map_to_expected_statuses() {
        assert_eq!(
            EngineError::MissingApiKey.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            EngineError::InvalidApiKey.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            EngineError::AdminAuthNotConfigured.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_details_are_hidden() {
        let err = EngineError::internal("db password is hunter2");
        assert_eq!(err.code(), "internal_error");
        assert!(err.safe_details().is_none());
    }

    #[tokio::test]
    async fn into_response_carries_code() {
        let response = EngineError::MissingProductId.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "missing_product_id");
    }
}
