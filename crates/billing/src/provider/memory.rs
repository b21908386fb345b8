//! In-memory billing provider
//!
//! Backs the local sandbox and the test suites. Objects are seeded or created
//! through the trait and can be mutated to simulate provider-side transitions
//! (a payment finishing processing, a subscription going active).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{
    BillingProvider, CustomerInfo, CustomerUpdate, NewCustomer, NewPaymentIntent,
    NewSubscription, PaymentIntentInfo, PaymentIntentState, SubscriptionInfo,
    SubscriptionState,
};
use crate::error::{BillingError, BillingResult};

#[derive(Default)]
struct ProviderState {
    payment_intents: HashMap<String, PaymentIntentInfo>,
    subscriptions: HashMap<String, SubscriptionInfo>,
    customers: HashMap<String, CustomerInfo>,
    /// invoice id -> payment intent id
    invoices: HashMap<String, String>,
    customer_updates: usize,
}

#[derive(Default)]
pub struct InMemoryBillingProvider {
    state: Mutex<ProviderState>,
    next_id: AtomicU64,
}

impl InMemoryBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_mem{:06}", prefix, n)
    }

    pub async fn insert_payment_intent(&self, intent: PaymentIntentInfo) {
        self.state
            .lock()
            .await
            .payment_intents
            .insert(intent.id.clone(), intent);
    }

    /// Insert a subscription; its expanded latest payment intent (if any) is
    /// registered as the payment of its latest invoice
    pub async fn insert_subscription(&self, subscription: SubscriptionInfo) {
        let mut state = self.state.lock().await;
        if let (Some(invoice_id), Some(intent)) = (
            subscription.latest_invoice_id.clone(),
            subscription.latest_payment_intent.clone(),
        ) {
            state.invoices.insert(invoice_id, intent.id.clone());
            state.payment_intents.insert(intent.id.clone(), intent);
        }
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn insert_customer(&self, customer: CustomerInfo) {
        self.state
            .lock()
            .await
            .customers
            .insert(customer.id.clone(), customer);
    }

    pub async fn set_payment_intent_status(&self, id: &str, status: PaymentIntentState) {
        let mut state = self.state.lock().await;
        if let Some(intent) = state.payment_intents.get_mut(id) {
            intent.status = status.clone();
        }
        for subscription in state.subscriptions.values_mut() {
            if let Some(intent) = subscription.latest_payment_intent.as_mut() {
                if intent.id == id {
                    intent.status = status.clone();
                }
            }
        }
    }

    pub async fn set_subscription_status(&self, id: &str, status: SubscriptionState) {
        if let Some(subscription) = self.state.lock().await.subscriptions.get_mut(id) {
            subscription.status = status;
        }
    }

    pub async fn set_subscription_period_end(&self, id: &str, period_end: OffsetDateTime) {
        if let Some(subscription) = self.state.lock().await.subscriptions.get_mut(id) {
            subscription.current_period_end = Some(period_end);
        }
    }

    pub async fn customer(&self, id: &str) -> Option<CustomerInfo> {
        self.state.lock().await.customers.get(id).cloned()
    }

    pub async fn customer_count(&self) -> usize {
        self.state.lock().await.customers.len()
    }

    pub async fn payment_intent_count(&self) -> usize {
        self.state.lock().await.payment_intents.len()
    }

    pub async fn customer_update_count(&self) -> usize {
        self.state.lock().await.customer_updates
    }
}

#[async_trait]
impl BillingProvider for InMemoryBillingProvider {
    async fn retrieve_payment_intent(&self, id: &str) -> BillingResult<PaymentIntentInfo> {
        self.state
            .lock()
            .await
            .payment_intents
            .get(id)
            .cloned()
            .ok_or_else(|| BillingError::PaymentIntentNotFound(id.to_string()))
    }

    async fn create_payment_intent(
        &self,
        params: NewPaymentIntent,
    ) -> BillingResult<PaymentIntentInfo> {
        let id = self.generate_id("pi");
        let intent = PaymentIntentInfo {
            client_secret: Some(format!("{}_secret", id)),
            id,
            status: PaymentIntentState::RequiresPaymentMethod,
            amount: params.amount,
            currency: params.currency,
            customer_id: Some(params.customer_id),
            metadata: params.metadata,
        };
        self.insert_payment_intent(intent.clone()).await;
        Ok(intent)
    }

    async fn retrieve_subscription(&self, id: &str) -> BillingResult<SubscriptionInfo> {
        self.state
            .lock()
            .await
            .subscriptions
            .get(id)
            .cloned()
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }

    async fn create_subscription(
        &self,
        params: NewSubscription,
    ) -> BillingResult<SubscriptionInfo> {
        let intent_id = self.generate_id("pi");
        let intent = PaymentIntentInfo {
            client_secret: Some(format!("{}_secret", intent_id)),
            id: intent_id,
            status: PaymentIntentState::RequiresPaymentMethod,
            amount: 0,
            currency: "usd".to_string(),
            customer_id: Some(params.customer_id.clone()),
            metadata: params.metadata.clone(),
        };
        let subscription = SubscriptionInfo {
            id: self.generate_id("sub"),
            status: SubscriptionState::Incomplete,
            customer_id: params.customer_id,
            current_period_end: Some(OffsetDateTime::now_utc() + time::Duration::days(30)),
            price_id: Some(params.price_id),
            latest_invoice_id: Some(self.generate_id("in")),
            latest_payment_intent: Some(intent),
            metadata: params.metadata,
        };
        self.insert_subscription(subscription.clone()).await;
        Ok(subscription)
    }

    async fn activate_subscription(&self, id: &str) -> BillingResult<SubscriptionInfo> {
        let mut state = self.state.lock().await;
        let subscription = state
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))?;
        subscription.status = SubscriptionState::Active;
        subscription
            .metadata
            .insert("activated_by".to_string(), "reconciliation".to_string());
        Ok(subscription.clone())
    }

    async fn retrieve_customer(&self, id: &str) -> BillingResult<CustomerInfo> {
        self.customer(id)
            .await
            .ok_or_else(|| BillingError::CustomerNotFound(id.to_string()))
    }

    async fn create_customer(&self, params: NewCustomer) -> BillingResult<CustomerInfo> {
        let customer = CustomerInfo {
            id: self.generate_id("cus"),
            email: params.email,
            name: params.name,
            description: params.description,
        };
        self.insert_customer(customer.clone()).await;
        Ok(customer)
    }

    async fn update_customer(
        &self,
        id: &str,
        params: CustomerUpdate,
    ) -> BillingResult<CustomerInfo> {
        let mut state = self.state.lock().await;
        state.customer_updates += 1;
        let customer = state
            .customers
            .get_mut(id)
            .ok_or_else(|| BillingError::CustomerNotFound(id.to_string()))?;
        if params.email.is_some() {
            customer.email = params.email;
        }
        if params.name.is_some() {
            customer.name = params.name;
        }
        if params.description.is_some() {
            customer.description = params.description;
        }
        Ok(customer.clone())
    }

    async fn invoice_payment_intent(
        &self,
        invoice_id: &str,
    ) -> BillingResult<Option<PaymentIntentInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .get(invoice_id)
            .and_then(|intent_id| state.payment_intents.get(intent_id))
            .cloned())
    }
}
