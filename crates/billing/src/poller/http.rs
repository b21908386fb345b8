//! HTTP client for the billing API
//!
//! Lets a native client run the poller against a deployed API: charges are
//! created through the API, confirmed by a [`CardConfirmer`] (the provider's
//! client SDK on the device), then reconciled through the API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ChargeSubmitter, PlanSelection, ReconcileClient, SubmittedCharge};
use crate::checkout::ChargeSession;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{ReconcileOutcome, ReconcileRequest, ReconcileResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateChargeBody<'a> {
    user_id: Uuid,
    plan_name: &'a str,
}

/// Authenticated client for `/api/v1/billing`
#[derive(Clone)]
pub struct BillingApiClient {
    http: Client,
    base_url: String,
    access_token: String,
}

impl BillingApiClient {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> BillingResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/billing/{}", self.base_url, path)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> BillingResult<T>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        Err(map_error_response(status, &text))
    }

    pub async fn create_payment_intent(
        &self,
        user_id: Uuid,
        plan_name: &str,
    ) -> BillingResult<ChargeSession> {
        self.post("payment-intents", &CreateChargeBody { user_id, plan_name })
            .await
    }

    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        plan_name: &str,
    ) -> BillingResult<ChargeSession> {
        self.post("subscriptions", &CreateChargeBody { user_id, plan_name })
            .await
    }
}

/// Map an API error body back onto a billing error
fn map_error_response(status: StatusCode, body: &str) -> BillingError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let message = parsed
        .as_ref()
        .map(|e| e.error.message.clone())
        .unwrap_or_else(|| format!("HTTP {}", status));

    if let Some(envelope) = &parsed {
        if envelope.error.code == "CARD_DECLINED" {
            return BillingError::CardDeclined {
                code: "card_declined".to_string(),
                message,
            };
        }
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BillingError::Unauthorized(message),
        StatusCode::NOT_FOUND => BillingError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => BillingError::Http(message),
        s if s.is_client_error() => BillingError::InvalidInput(message),
        _ => BillingError::Http(message),
    }
}

#[async_trait]
impl ReconcileClient for BillingApiClient {
    async fn reconcile(&self, request: &ReconcileRequest) -> BillingResult<ReconcileOutcome> {
        let response: ReconcileResponse = self.post("reconcile", request).await?;
        Ok(response.into())
    }
}

/// Confirms a charge on the device and reports the resulting payment status
#[async_trait]
pub trait CardConfirmer: Send + Sync {
    async fn confirm(&self, session: &ChargeSession) -> BillingResult<String>;
}

/// Creates the charge through the API, then confirms it on the device
pub struct ConfirmingSubmitter {
    api: BillingApiClient,
    confirmer: Arc<dyn CardConfirmer>,
}

impl ConfirmingSubmitter {
    pub fn new(api: BillingApiClient, confirmer: Arc<dyn CardConfirmer>) -> Self {
        Self { api, confirmer }
    }
}

#[async_trait]
impl ChargeSubmitter for ConfirmingSubmitter {
    async fn submit(
        &self,
        user_id: Uuid,
        selection: &PlanSelection,
    ) -> BillingResult<SubmittedCharge> {
        let plan_name = selection.plan.display_name();
        let session = if selection.plan.is_recurring() {
            self.api.create_subscription(user_id, plan_name).await?
        } else {
            self.api.create_payment_intent(user_id, plan_name).await?
        };

        let status = self.confirmer.confirm(&session).await?;

        Ok(SubmittedCharge {
            is_subscription: session.is_subscription,
            payment_intent_id: session.payment_intent_id,
            subscription_id: session.subscription_id,
            customer_id: Some(session.customer_id),
            price_id: session.price_id,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use wedmatch_shared::PlanKind;

    use super::*;

    struct SucceedingConfirmer;

    #[async_trait]
    impl CardConfirmer for SucceedingConfirmer {
        async fn confirm(&self, session: &ChargeSession) -> BillingResult<String> {
            assert!(session.client_secret.is_some());
            Ok("processing".to_string())
        }
    }

    fn request(user_id: Uuid) -> ReconcileRequest {
        ReconcileRequest {
            subscription_id: Some("sub_1".to_string()),
            user_id,
            plan_name: "Monthly Plan".to_string(),
            plan_price: "$9.99/month".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_map_error_response() {
        let declined = map_error_response(
            StatusCode::PAYMENT_REQUIRED,
            r#"{"error":{"code":"CARD_DECLINED","message":"Your card was declined."}}"#,
        );
        assert!(matches!(
            declined,
            BillingError::CardDeclined { ref message, .. } if message == "Your card was declined."
        ));

        assert!(matches!(
            map_error_response(StatusCode::UNAUTHORIZED, ""),
            BillingError::Unauthorized(_)
        ));
        assert!(matches!(
            map_error_response(StatusCode::BAD_REQUEST, "{}"),
            BillingError::InvalidInput(_)
        ));
        let outage = map_error_response(StatusCode::BAD_GATEWAY, "upstream");
        assert!(outage.is_transient());
    }

    #[tokio::test]
    async fn test_reconcile_posts_with_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/billing/reconcile")
            .match_header("authorization", "Bearer token-123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success":true,"alreadyProcessed":false,"isSubscription":true,"message":"Payment confirmed and plan activated"}"#)
            .create_async()
            .await;

        let client = BillingApiClient::new(server.url(), "token-123").unwrap();
        let outcome = client.reconcile(&request(Uuid::new_v4())).await.unwrap();

        assert!(outcome.applied);
        assert!(outcome.is_subscription);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_reconcile_pending_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/billing/reconcile")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success":false,"isSubscription":true,"status":"incomplete"}"#)
            .create_async()
            .await;

        let client = BillingApiClient::new(server.url(), "token").unwrap();
        let outcome = client.reconcile(&request(Uuid::new_v4())).await.unwrap();

        assert!(!outcome.is_success());
        assert_eq!(outcome.pending_status.as_deref(), Some("incomplete"));
    }

    #[tokio::test]
    async fn test_confirming_submitter_creates_subscription_for_recurring_plan() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/billing/subscriptions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"isSubscription":true,"paymentIntentId":"pi_1","subscriptionId":"sub_1",
                    "clientSecret":"pi_1_secret","customerId":"cus_1","priceId":"price_monthly",
                    "planName":"Monthly Plan","amountCents":999,"currency":"usd"}"#,
            )
            .create_async()
            .await;

        let api = BillingApiClient::new(server.url(), "token").unwrap();
        let submitter = ConfirmingSubmitter::new(api, Arc::new(SucceedingConfirmer));
        let charge = submitter
            .submit(Uuid::new_v4(), &PlanSelection::new(PlanKind::Monthly, "$9.99/month"))
            .await
            .unwrap();

        assert!(charge.is_subscription);
        assert_eq!(charge.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(charge.customer_id.as_deref(), Some("cus_1"));
        assert_eq!(charge.status, "processing");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_card_decline_surfaces_from_api() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/billing/payment-intents")
            .with_status(402)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"code":"CARD_DECLINED","message":"Your card has expired."}}"#)
            .create_async()
            .await;

        let api = BillingApiClient::new(server.url(), "token").unwrap();
        let err = api
            .create_payment_intent(Uuid::new_v4(), "Unlimited Plan")
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::CardDeclined { .. }));
    }
}
