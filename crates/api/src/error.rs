//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use wedmatch_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication failures are answered by the auth middleware
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource already exists")]
    Conflict(String),

    // Billing errors
    #[error("{0}")]
    CardDeclined(String),
    #[error("Payment provider error")]
    PaymentProvider,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Billing
            ApiError::CardDeclined(msg) => (StatusCode::PAYMENT_REQUIRED, "CARD_DECLINED", msg.clone()),
            ApiError::PaymentProvider => (StatusCode::BAD_GATEWAY, "PAYMENT_PROVIDER_ERROR", self.to_string()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // PostgreSQL unique violation
                    if code == "23505" {
                        return ApiError::Conflict("Resource already exists".to_string());
                    }
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::CardDeclined { message, .. } => ApiError::CardDeclined(message),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::WebhookPayloadInvalid(msg) => ApiError::BadRequest(msg),
            BillingError::Unauthorized(msg) => {
                tracing::warn!(reason = %msg, "Billing request rejected for caller");
                ApiError::Forbidden
            }
            BillingError::NotFound(_)
            | BillingError::CustomerNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::PaymentIntentNotFound(_)
            | BillingError::UserNotResolved(_) => ApiError::NotFound,
            BillingError::StripeApi(msg) | BillingError::Http(msg) => {
                tracing::error!(error = %msg, "Payment provider call failed");
                ApiError::PaymentProvider
            }
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Billing database error");
                ApiError::Database(msg)
            }
            BillingError::WebhookEventNotSupported(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => {
                tracing::error!(error = %err, "Billing internal error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_declined_keeps_translated_message() {
        let err: ApiError = BillingError::CardDeclined {
            code: "insufficient_funds".to_string(),
            message: "Your card has insufficient funds.".to_string(),
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_billing_error_status_mapping() {
        let cases = [
            (BillingError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::WebhookSignatureInvalid, StatusCode::BAD_REQUEST),
            (BillingError::Unauthorized("x".into()), StatusCode::FORBIDDEN),
            (BillingError::PaymentIntentNotFound("pi".into()), StatusCode::NOT_FOUND),
            (BillingError::StripeApi("down".into()), StatusCode::BAD_GATEWAY),
            (BillingError::Database("pool".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (BillingError::Internal("bug".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            let label = err.to_string();
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected, "{}", label);
        }
    }
}
