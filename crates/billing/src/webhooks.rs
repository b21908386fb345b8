//! Stripe webhook ingestion
//!
//! Verifies the `Stripe-Signature` header, de-duplicates deliveries by event
//! id and routes the four events the pipeline cares about into the
//! reconciliation engine. Everything else is acknowledged and ignored.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{METADATA_PLAN_NAME, METADATA_USER_ID};
use crate::reconcile::{plan_description, ReconcileRequest, ReconciliationEngine};
use crate::store::{EventClaim, NewPaymentHistory, Renewal, RenewalOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const EVENT_CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const EVENT_INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const EVENT_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

const HANDLED_EVENTS: [&str; 4] = [
    EVENT_CHECKOUT_COMPLETED,
    EVENT_PAYMENT_INTENT_SUCCEEDED,
    EVENT_INVOICE_PAYMENT_SUCCEEDED,
    EVENT_SUBSCRIPTION_DELETED,
];

/// Billing reason of the first invoice of a subscription
const BILLING_REASON_SUBSCRIPTION_CREATE: &str = "subscription_create";

// =============================================================================
// Signature verification
// =============================================================================

/// Verify a `t=<unix>,v1=<hex>` signature header against the raw body.
///
/// The signed message is `"<t>.<body>"`, keyed with the endpoint secret.
/// Any of several `v1` entries may match (the provider sends one per active
/// secret during rotation).
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("SECURITY: webhook signature header missing timestamp");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("SECURITY: webhook signature header missing v1 signature");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "SECURITY: webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    // verify_slice compares in constant time
    let matched = signatures.iter().any(|signature| {
        hex::decode(signature)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if !matched {
        tracing::warn!("SECURITY: webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Build a signature header for a payload (local tooling and tests)
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

// =============================================================================
// Payload model
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    subscription: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    invoice: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionDetails {
    #[serde(default)]
    subscription: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct InvoiceParent {
    #[serde(default)]
    subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    subscription: Option<String>,
    #[serde(default)]
    billing_reason: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    subscription_details: Option<SubscriptionDetails>,
    /// Newer API versions nest subscription details under `parent`
    #[serde(default)]
    parent: Option<InvoiceParent>,
}

impl InvoiceObject {
    fn subscription_details(&self) -> Option<&SubscriptionDetails> {
        self.subscription_details.as_ref().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|parent| parent.subscription_details.as_ref())
        })
    }

    fn subscription_id(&self) -> Option<String> {
        self.subscription
            .clone()
            .or_else(|| self.subscription_details().and_then(|d| d.subscription.clone()))
    }

    fn metadata(&self) -> HashMap<String, String> {
        self.subscription_details()
            .map(|d| d.metadata.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
}

fn decode_object<T: serde::de::DeserializeOwned>(event: &WebhookEvent) -> BillingResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        BillingError::WebhookPayloadInvalid(format!(
            "{} object for {}: {}",
            event.event_type, event.id, e
        ))
    })
}

/// What happened to a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    Processed,
    Duplicate,
    Ignored,
}

// =============================================================================
// Ingestor
// =============================================================================

/// Webhook ingestor for provider events
#[derive(Clone)]
pub struct WebhookIngestor {
    engine: ReconciliationEngine,
    webhook_secret: String,
}

impl WebhookIngestor {
    pub fn new(engine: ReconciliationEngine, webhook_secret: impl Into<String>) -> Self {
        Self {
            engine,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify and parse a delivery
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        verify_signature(payload, signature, &self.webhook_secret, now_unix())?;

        serde_json::from_slice(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookPayloadInvalid(e.to_string())
        })
    }

    /// Verify, de-duplicate and process one delivery
    pub async fn ingest(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookAck> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(event).await
    }

    /// Handle a verified event.
    ///
    /// The event id is claimed atomically before processing; a delivery that
    /// loses the claim is acknowledged without doing anything.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookAck> {
        if !HANDLED_EVENTS.contains(&event.event_type.as_str()) {
            tracing::info!(
                event_type = %event.event_type,
                event_id = %event.id,
                "Received unhandled Stripe event type - ignoring"
            );
            return Ok(WebhookAck::Ignored);
        }

        let store = self.engine.store();
        match store.claim_event(&event.id, &event.event_type).await? {
            EventClaim::Claimed => {}
            EventClaim::Duplicate { status } => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    status = %status,
                    "Duplicate webhook event - already claimed"
                );
                return Ok(WebhookAck::Duplicate);
            }
        }

        tracing::info!(
            event_type = %event.event_type,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(&event).await;

        let error_message = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = store.finish_event(&event.id, error_message.as_deref()).await {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook processing result; event may appear stuck in processing"
            );
        }

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook event processing failed"
            );
        }

        result.map(|()| WebhookAck::Processed)
    }

    async fn process_event_internal(&self, event: &WebhookEvent) -> BillingResult<()> {
        match event.event_type.as_str() {
            EVENT_CHECKOUT_COMPLETED => self.handle_checkout_completed(event).await,
            EVENT_PAYMENT_INTENT_SUCCEEDED => self.handle_payment_intent_succeeded(event).await,
            EVENT_INVOICE_PAYMENT_SUCCEEDED => self.handle_invoice_payment_succeeded(event).await,
            EVENT_SUBSCRIPTION_DELETED => self.handle_subscription_deleted(event).await,
            _ => Ok(()),
        }
    }

    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> BillingResult<()> {
        let session: CheckoutSessionObject = decode_object(event)?;

        if session.mode.as_deref() != Some("subscription") {
            tracing::debug!(
                session_id = %session.id,
                mode = ?session.mode,
                "Ignoring non-subscription checkout session"
            );
            return Ok(());
        }

        let subscription_id = session.subscription.clone().ok_or_else(|| {
            BillingError::WebhookPayloadInvalid(format!(
                "checkout session {} has no subscription",
                session.id
            ))
        })?;

        let user_id = self
            .resolve_user(
                session.client_reference_id.as_deref(),
                &session.metadata,
                session.customer.as_deref(),
            )
            .await?;

        let plan_name = self
            .plan_name_for_subscription(&subscription_id, &session.metadata)
            .await?;

        self.activate(ReconcileRequest {
            subscription_id: Some(subscription_id),
            user_id,
            plan_name,
            ..Default::default()
        })
        .await
    }

    async fn handle_payment_intent_succeeded(&self, event: &WebhookEvent) -> BillingResult<()> {
        let intent: PaymentIntentObject = decode_object(event)?;

        if intent.invoice.is_some() {
            // Subscription invoice payments arrive via the invoice events
            tracing::debug!(payment_intent_id = %intent.id, "Ignoring invoice payment intent");
            return Ok(());
        }

        let Some(plan_name) = intent.metadata.get(METADATA_PLAN_NAME).cloned() else {
            tracing::warn!(
                payment_intent_id = %intent.id,
                "Payment intent has no plan metadata - not a plan purchase"
            );
            return Ok(());
        };

        let user_id = self
            .resolve_user(None, &intent.metadata, intent.customer.as_deref())
            .await?;

        self.activate(ReconcileRequest {
            payment_intent_id: Some(intent.id),
            user_id,
            plan_name,
            ..Default::default()
        })
        .await
    }

    async fn handle_invoice_payment_succeeded(&self, event: &WebhookEvent) -> BillingResult<()> {
        let invoice: InvoiceObject = decode_object(event)?;

        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::debug!(invoice_id = %invoice.id, "Ignoring invoice without subscription");
            return Ok(());
        };

        let invoice_metadata = invoice.metadata();

        if invoice.billing_reason.as_deref() == Some(BILLING_REASON_SUBSCRIPTION_CREATE) {
            let user_id = self
                .resolve_user(None, &invoice_metadata, invoice.customer.as_deref())
                .await?;
            let plan_name = self
                .plan_name_for_subscription(&subscription_id, &invoice_metadata)
                .await?;

            return self
                .activate(ReconcileRequest {
                    subscription_id: Some(subscription_id),
                    user_id,
                    plan_name,
                    ..Default::default()
                })
                .await;
        }

        // Renewal: the allowance is replenished unconditionally
        let subscription = self
            .engine
            .provider()
            .retrieve_subscription(&subscription_id)
            .await?;

        let mut metadata = subscription.metadata.clone();
        metadata.extend(invoice_metadata);

        let user_id = self
            .resolve_user(None, &metadata, invoice.customer.as_deref())
            .await?;

        let plan = match self
            .engine
            .plan_for_charge(&metadata, subscription.price_id.as_deref())
        {
            Some(plan) => plan,
            None => self
                .engine
                .store()
                .load(user_id)
                .await?
                .map(|record| record.subscription_plan)
                .unwrap_or_default(),
        };

        let renewal = Renewal {
            user_id,
            plan,
            subscription_id: subscription_id.clone(),
            requests: plan.monthly_requests(),
            renewal_date: subscription.current_period_end,
            history: NewPaymentHistory {
                amount_cents: invoice.amount_paid,
                currency: invoice.currency.clone().unwrap_or_else(|| "usd".to_string()),
                plan_description: format!("{} renewal", plan_description(plan, "")),
                payment_reference: Some(
                    invoice.payment_intent.clone().unwrap_or_else(|| invoice.id.clone()),
                ),
                status: "succeeded".to_string(),
            },
        };

        match self.engine.store().commit_renewal(&renewal).await? {
            RenewalOutcome::Applied => tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                plan = %plan,
                requests = renewal.requests,
                "Subscription renewed"
            ),
            RenewalOutcome::Superseded => tracing::warn!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                "Renewal for a subscription the member no longer holds; charge recorded only"
            ),
        }

        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: &WebhookEvent) -> BillingResult<()> {
        let subscription: SubscriptionObject = decode_object(event)?;

        let affected = self
            .engine
            .store()
            .deactivate_subscription(&subscription.id)
            .await?;

        if affected == 0 {
            tracing::info!(
                subscription_id = %subscription.id,
                "Deleted subscription is not held by any member"
            );
        } else {
            tracing::info!(
                subscription_id = %subscription.id,
                members = affected,
                "Subscription deleted, entitlement deactivated"
            );
        }

        Ok(())
    }

    /// Creation events go through the same path as client reconcile calls
    async fn activate(&self, request: ReconcileRequest) -> BillingResult<()> {
        let outcome = self.engine.reconcile(&request).await?;
        tracing::info!(
            user_id = %request.user_id,
            applied = outcome.applied,
            already_processed = outcome.already_processed,
            pending_status = ?outcome.pending_status,
            "Webhook reconciliation finished"
        );
        Ok(())
    }

    async fn plan_name_for_subscription(
        &self,
        subscription_id: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<String> {
        if let Some(name) = metadata.get(METADATA_PLAN_NAME) {
            return Ok(name.clone());
        }

        let subscription = self
            .engine
            .provider()
            .retrieve_subscription(subscription_id)
            .await?;

        Ok(self
            .engine
            .plan_for_charge(&subscription.metadata, subscription.price_id.as_deref())
            .map(|plan| plan.display_name().to_string())
            .unwrap_or_default())
    }

    /// Find the member an event is about: explicit client reference, then
    /// metadata, then the customer (description marker or stored link)
    async fn resolve_user(
        &self,
        client_reference_id: Option<&str>,
        metadata: &HashMap<String, String>,
        customer_id: Option<&str>,
    ) -> BillingResult<Uuid> {
        if let Some(user_id) = client_reference_id.and_then(|id| Uuid::parse_str(id.trim()).ok()) {
            return Ok(user_id);
        }

        if let Some(user_id) = metadata
            .get(METADATA_USER_ID)
            .and_then(|id| Uuid::parse_str(id.trim()).ok())
        {
            return Ok(user_id);
        }

        if let Some(customer_id) = customer_id {
            if let Some(user_id) = self.engine.customers().user_for_customer(customer_id).await? {
                return Ok(user_id);
            }
            return Err(BillingError::UserNotResolved(format!("customer {}", customer_id)));
        }

        Err(BillingError::UserNotResolved(
            "event without member reference".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn test_valid_signature_passes() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign_payload(payload, SECRET, now).unwrap();
        assert!(verify_signature(payload, &header, SECRET, now + 10).is_ok());
    }

    #[test]
    fn test_tampered_body_fails() {
        let now = 1_700_000_000;
        let header = sign_payload(br#"{"id":"evt_1"}"#, SECRET, now).unwrap();
        assert!(matches!(
            verify_signature(br#"{"id":"evt_2"}"#, &header, SECRET, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let payload = b"{}";
        let now = 1_700_000_000;
        let header = sign_payload(payload, "whsec_other", now).unwrap();
        assert!(verify_signature(payload, &header, SECRET, now).is_err());
    }

    #[test]
    fn test_stale_timestamp_fails() {
        let payload = b"{}";
        let signed_at = 1_700_000_000;
        let header = sign_payload(payload, SECRET, signed_at).unwrap();
        assert!(verify_signature(payload, &header, SECRET, signed_at + 301).is_err());
        assert!(verify_signature(payload, &header, SECRET, signed_at + 300).is_ok());
    }

    #[test]
    fn test_any_v1_may_match() {
        let payload = b"{}";
        let now = 1_700_000_000;
        let good = sign_payload(payload, SECRET, now).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1={},v1={}", now, "00".repeat(32), good_sig);
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_malformed_headers_fail() {
        assert!(verify_signature(b"{}", "", SECRET, 0).is_err());
        assert!(verify_signature(b"{}", "t=abc,v1=00", SECRET, 0).is_err());
        assert!(verify_signature(b"{}", "t=0", SECRET, 0).is_err());
        assert!(verify_signature(b"{}", "t=0,v1=not-hex", SECRET, 0).is_err());
    }

    #[test]
    fn test_invoice_subscription_from_parent() {
        let invoice: InvoiceObject = serde_json::from_value(serde_json::json!({
            "id": "in_1",
            "billing_reason": "subscription_cycle",
            "parent": {
                "subscription_details": {
                    "subscription": "sub_1",
                    "metadata": { "plan_name": "Premium Plan" }
                }
            }
        }))
        .unwrap();

        assert_eq!(invoice.subscription_id().as_deref(), Some("sub_1"));
        assert_eq!(
            invoice.metadata().get(METADATA_PLAN_NAME).map(String::as_str),
            Some("Premium Plan")
        );
    }
}
