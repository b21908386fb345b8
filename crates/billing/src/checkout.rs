//! Charge creation
//!
//! Creates the provider objects the client confirms: a payment intent for
//! one-time plans, a default-incomplete subscription for recurring plans. The
//! member's customer is resolved (or created) first so every charge is made
//! under the member's single customer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wedmatch_shared::PlanKind;

use crate::client::StripeConfig;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, NewPaymentIntent, NewSubscription, METADATA_PLAN_NAME, METADATA_USER_ID,
};

/// A charge awaiting client-side confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeSession {
    pub is_subscription: bool,
    #[serde(default)]
    pub payment_intent_id: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub customer_id: String,
    #[serde(default)]
    pub price_id: Option<String>,
    pub plan_name: String,
    pub amount_cents: i64,
    pub currency: String,
}

/// Checkout service for creating charges
#[derive(Clone)]
pub struct CheckoutService {
    provider: Arc<dyn BillingProvider>,
    customers: CustomerService,
    config: StripeConfig,
}

fn charge_metadata(user_id: Uuid, plan: PlanKind) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(METADATA_USER_ID.to_string(), user_id.to_string());
    metadata.insert(METADATA_PLAN_NAME.to_string(), plan.display_name().to_string());
    metadata
}

impl CheckoutService {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        customers: CustomerService,
        config: StripeConfig,
    ) -> Self {
        Self {
            provider,
            customers,
            config,
        }
    }

    /// Create a charge for whichever kind of plan was selected
    pub async fn create_charge(&self, user_id: Uuid, plan_name: &str) -> BillingResult<ChargeSession> {
        let plan = PlanKind::lookup(plan_name)
            .ok_or_else(|| BillingError::InvalidInput(format!("Unknown plan: {}", plan_name)))?;

        if plan.is_recurring() {
            self.create_subscription(user_id, plan).await
        } else {
            self.create_payment_intent(user_id, plan).await
        }
    }

    /// Create a payment intent for a one-time plan
    pub async fn create_payment_intent(
        &self,
        user_id: Uuid,
        plan: PlanKind,
    ) -> BillingResult<ChargeSession> {
        let amount = self.config.one_time_amount(plan).ok_or_else(|| {
            BillingError::InvalidInput(format!("{} is not sold as a one-time purchase", plan))
        })?;

        let customer_id = self.customers.get_or_create_customer(user_id).await?;

        let intent = self
            .provider
            .create_payment_intent(NewPaymentIntent {
                customer_id: customer_id.clone(),
                amount,
                currency: self.config.currency.clone(),
                description: plan.display_name().to_string(),
                metadata: charge_metadata(user_id, plan),
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            payment_intent_id = %intent.id,
            "Created one-time payment"
        );

        Ok(ChargeSession {
            is_subscription: false,
            payment_intent_id: Some(intent.id),
            subscription_id: None,
            client_secret: intent.client_secret,
            customer_id,
            price_id: None,
            plan_name: plan.display_name().to_string(),
            amount_cents: intent.amount,
            currency: intent.currency,
        })
    }

    /// Create a default-incomplete subscription for a recurring plan
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        plan: PlanKind,
    ) -> BillingResult<ChargeSession> {
        let price_id = self
            .config
            .price_id_for_plan(plan)
            .ok_or_else(|| {
                BillingError::InvalidInput(format!("{} is not sold as a subscription", plan))
            })?
            .to_string();

        let customer_id = self.customers.get_or_create_customer(user_id).await?;

        let subscription = self
            .provider
            .create_subscription(NewSubscription {
                customer_id: customer_id.clone(),
                price_id: price_id.clone(),
                metadata: charge_metadata(user_id, plan),
            })
            .await?;

        let payment = subscription.latest_payment_intent.clone();

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            subscription_id = %subscription.id,
            "Created subscription awaiting first payment"
        );

        Ok(ChargeSession {
            is_subscription: true,
            payment_intent_id: payment.as_ref().map(|p| p.id.clone()),
            subscription_id: Some(subscription.id),
            client_secret: payment.as_ref().and_then(|p| p.client_secret.clone()),
            customer_id,
            price_id: Some(price_id),
            plan_name: plan.display_name().to_string(),
            amount_cents: payment.as_ref().map(|p| p.amount).unwrap_or(0),
            currency: payment
                .map(|p| p.currency)
                .unwrap_or_else(|| self.config.currency.clone()),
        })
    }
}
