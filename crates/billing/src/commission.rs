//! Referral commission events
//!
//! A member who signed up with a referral code earns the referrer a
//! commission on their first confirmed purchase. The reconciliation engine
//! appends a [`CommissionEvent`] to the outbox after its transaction commits;
//! the worker drains the outbox and delivers events to the affiliate service
//! with [`CommissionDispatcher`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRIES: usize = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub referral_code: String,
    pub plan_name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub payment_reference: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Affiliate service endpoint
#[derive(Debug, Clone)]
pub struct CommissionConfig {
    pub endpoint_url: String,
    pub service_key: String,
}

impl CommissionConfig {
    /// Returns `None` when the affiliate service is not configured
    pub fn from_env() -> Option<Self> {
        let endpoint_url = std::env::var("AFFILIATE_COMMISSION_URL").ok()?;
        let service_key = std::env::var("AFFILIATE_SERVICE_KEY").ok()?;
        if endpoint_url.trim().is_empty() {
            return None;
        }
        Some(Self {
            endpoint_url,
            service_key,
        })
    }
}

/// Delivers commission events to the affiliate service
#[derive(Clone)]
pub struct CommissionDispatcher {
    http: reqwest::Client,
    config: CommissionConfig,
}

impl CommissionDispatcher {
    pub fn new(config: CommissionConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Deliver one event, retrying transient failures with backoff.
    ///
    /// The affiliate service de-duplicates on `event.id`, so a retry after a
    /// lost response is harmless.
    pub async fn dispatch(&self, event: &CommissionEvent) -> BillingResult<()> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_RETRIES)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.send(event).await;

            match &result {
                Ok(()) => Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        event_id = %event.id,
                        error = %e,
                        "Transient commission delivery error - will retry"
                    );
                    Err(result)
                }
                Err(_) => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }

    async fn send(&self, event: &CommissionEvent) -> BillingResult<()> {
        let response = self
            .http
            .post(&self.config.endpoint_url)
            .bearer_auth(&self.config.service_key)
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(
                event_id = %event.id,
                user_id = %event.user_id,
                referral_code = %event.referral_code,
                "Delivered referral commission event"
            );
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(BillingError::Http(format!("affiliate service returned {}: {}", status, body)))
        } else {
            Err(BillingError::InvalidInput(format!(
                "affiliate service rejected event ({}): {}",
                status, body
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_camel_case() {
        let event = CommissionEvent {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            referral_code: "FRIEND10".to_string(),
            plan_name: "Monthly Plan".to_string(),
            amount_cents: 999,
            currency: "usd".to_string(),
            payment_reference: Some("pi_123".to_string()),
            created_at: OffsetDateTime::UNIX_EPOCH,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["referralCode"], "FRIEND10");
        assert_eq!(json["amountCents"], 999);
        assert_eq!(json["paymentReference"], "pi_123");
        assert_eq!(json["createdAt"], "1970-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let dispatcher = CommissionDispatcher::new(CommissionConfig {
            endpoint_url: "http://127.0.0.1:1/commissions".to_string(),
            service_key: "key".to_string(),
        })
        .unwrap();

        let event = CommissionEvent {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            referral_code: "FRIEND10".to_string(),
            plan_name: "Monthly Plan".to_string(),
            amount_cents: 999,
            currency: "usd".to_string(),
            payment_reference: None,
            created_at: OffsetDateTime::now_utc(),
        };

        let err = dispatcher.dispatch(&event).await.unwrap_err();
        assert!(err.is_transient());
    }
}
