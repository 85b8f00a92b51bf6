//! Typed API errors and their HTTP mapping. Payment-kind errors carry the
//! 402 requirements document so clients can pay and retry.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use x402::{PaymentRequiredResponse, PaymentRequirements, X402_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("payment required")]
    PaymentRequired(Box<PaymentRequiredResponse>),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("fraud detected: {0}")]
    FraudDetected(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("too many in-flight uploads")]
    TooManyUploads,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("dependency unavailable")]
    Transient(anyhow::Error),
    #[error("internal error")]
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn payment_required(requirements: PaymentRequirements, error: impl Into<String>) -> Self {
        Self::PaymentRequired(Box::new(PaymentRequiredResponse {
            x402_version: X402_VERSION,
            accepts: vec![requirements],
            error: error.into(),
        }))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::PaymentRequired(_) | Self::FraudDetected(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyUploads => StatusCode::TOO_MANY_REQUESTS,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::PaymentRequired(doc) => (status, Json(*doc)).into_response(),
            Self::FraudDetected(msg) => {
                (status, Json(serde_json::json!({ "error": msg }))).into_response()
            }
            Self::Transient(err) => {
                tracing::warn!(err = ?err, "dependency failure");
                (
                    status,
                    Json(serde_json::json!({ "error": "dependency unavailable" })),
                )
                    .into_response()
            }
            Self::Internal(err) => {
                tracing::error!(err = ?err, "internal error");
                (
                    status,
                    Json(serde_json::json!({ "error": "internal error" })),
                )
                    .into_response()
            }
            other => (
                status,
                Json(serde_json::json!({ "error": other.to_string() })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x402::Network;

    #[test]
    fn statuses_match_the_error_kinds() {
        let reqs = PaymentRequirements::usdc(
            Network::Base,
            alloy::primitives::Address::repeat_byte(1),
            "1000".into(),
            "/r".into(),
            "d".into(),
            "m".into(),
        );
        assert_eq!(
            ApiError::payment_required(reqs, "no header").status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ApiError::FraudDetected("x".into()).status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ApiError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::TooManyUploads.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Transient(anyhow::anyhow!("db")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
