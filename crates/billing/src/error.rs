//! Billing error types

use thiserror::Error;
use wedmatch_shared::SharedError;

use crate::card_errors::card_error_message;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Card declined ({code}): {message}")]
    CardDeclined { code: String, message: String },

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Payment intent not found: {0}")]
    PaymentIntentNotFound(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload could not be parsed: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Webhook event type not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Could not resolve user for {0}")]
    UserNotResolved(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl BillingError {
    /// Errors worth retrying later (network, provider outage, pool exhaustion)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::StripeApi(_) | BillingError::Database(_) | BillingError::Http(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        if let stripe::StripeError::Stripe(request_error) = &err {
            if matches!(request_error.error_type, stripe::ErrorType::Card) {
                let code = request_error
                    .decline_code
                    .clone()
                    .unwrap_or_else(|| "card_declined".to_string());
                return BillingError::CardDeclined {
                    message: card_error_message(&code).to_string(),
                    code,
                };
            }
        }
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Http(err.to_string())
    }
}

impl From<SharedError> for BillingError {
    fn from(err: SharedError) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
