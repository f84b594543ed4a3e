//! API error types and HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tutorlink_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,
}

impl ApiError {
    /// HTTP status and stable machine-readable code for each error
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Billing(e) => match e {
                BillingError::NoActiveSubscription(_) => {
                    (StatusCode::NOT_FOUND, "no_active_subscription")
                }
                BillingError::PlanNotFound(_) => (StatusCode::NOT_FOUND, "plan_not_found"),
                BillingError::NoOpChange(_) => (StatusCode::BAD_REQUEST, "no_op_change"),
                BillingError::PaymentFailed(_) => {
                    (StatusCode::PAYMENT_REQUIRED, "payment_failed")
                }
                BillingError::ConcurrentModification => {
                    (StatusCode::CONFLICT, "concurrent_modification")
                }
                BillingError::InvalidStateTransition(_) => {
                    (StatusCode::CONFLICT, "invalid_state_transition")
                }
                BillingError::Database(_) | BillingError::Serialization(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            ApiError::Billing(e) => {
                e.is_retryable() || matches!(e, BillingError::ConcurrentModification)
            }
            _ => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // 5xx details stay in the logs, not the response body
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Internal error");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": message,
            "code": code,
            "retryable": self.retryable(),
        }));

        (status, body).into_response()
    }
}
