//! Stripe implementation of [`BillingProvider`]

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    CreateCustomer, CreatePaymentIntent, CreatePaymentIntentAutomaticPaymentMethods,
    CreateSubscription, CreateSubscriptionItems, Currency, Customer, CustomerId, Expandable,
    Invoice, InvoiceId, PaymentIntent, PaymentIntentId, Subscription, SubscriptionId,
    SubscriptionPaymentBehavior, UpdateCustomer, UpdateSubscription,
};
use time::OffsetDateTime;

use super::{
    BillingProvider, CustomerInfo, CustomerUpdate, NewCustomer, NewPaymentIntent,
    NewSubscription, PaymentIntentInfo, PaymentIntentState, SubscriptionInfo,
    SubscriptionState,
};
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

const SUBSCRIPTION_EXPAND: &[&str] = &["latest_invoice.payment_intent"];

/// Billing provider backed by the Stripe API
#[derive(Clone)]
pub struct StripeBillingProvider {
    stripe: StripeClient,
}

impl StripeBillingProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    pub fn client(&self) -> &StripeClient {
        &self.stripe
    }
}

fn parse_payment_intent_id(id: &str) -> BillingResult<PaymentIntentId> {
    id.parse::<PaymentIntentId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid payment intent ID: {}", e)))
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse::<CustomerId>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))
}

fn customer_id_of(customer: &Expandable<Customer>) -> String {
    match customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    }
}

fn map_payment_intent(intent: &PaymentIntent) -> PaymentIntentInfo {
    PaymentIntentInfo {
        id: intent.id.to_string(),
        status: PaymentIntentState::from_provider(intent.status.as_str()),
        amount: intent.amount,
        currency: intent.currency.to_string(),
        customer_id: intent.customer.as_ref().map(customer_id_of),
        client_secret: intent.client_secret.clone(),
        metadata: intent.metadata.clone(),
    }
}

fn map_subscription(subscription: &Subscription) -> SubscriptionInfo {
    let (latest_invoice_id, latest_payment_intent) = match &subscription.latest_invoice {
        Some(Expandable::Id(id)) => (Some(id.to_string()), None),
        Some(Expandable::Object(invoice)) => {
            let intent = match &invoice.payment_intent {
                Some(Expandable::Object(intent)) => Some(map_payment_intent(intent)),
                _ => None,
            };
            (Some(invoice.id.to_string()), intent)
        }
        None => (None, None),
    };

    let price_id = subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    // Stripe reports 0 for subscriptions that never started a period
    let current_period_end = if subscription.current_period_end > 0 {
        OffsetDateTime::from_unix_timestamp(subscription.current_period_end).ok()
    } else {
        None
    };

    SubscriptionInfo {
        id: subscription.id.to_string(),
        status: SubscriptionState::from_provider(subscription.status.as_str()),
        customer_id: customer_id_of(&subscription.customer),
        current_period_end,
        price_id,
        latest_invoice_id,
        latest_payment_intent,
        metadata: subscription.metadata.clone(),
    }
}

fn map_customer(customer: &Customer) -> CustomerInfo {
    CustomerInfo {
        id: customer.id.to_string(),
        email: customer.email.clone(),
        name: customer.name.clone(),
        description: customer.description.clone(),
    }
}

#[async_trait]
impl BillingProvider for StripeBillingProvider {
    async fn retrieve_payment_intent(&self, id: &str) -> BillingResult<PaymentIntentInfo> {
        let intent_id = parse_payment_intent_id(id)?;
        let intent = PaymentIntent::retrieve(self.stripe.inner(), &intent_id, &[]).await?;
        Ok(map_payment_intent(&intent))
    }

    async fn create_payment_intent(
        &self,
        params: NewPaymentIntent,
    ) -> BillingResult<PaymentIntentInfo> {
        let currency = params
            .currency
            .parse::<Currency>()
            .map_err(|_| BillingError::Config(format!("Invalid currency: {}", params.currency)))?;

        let mut create = CreatePaymentIntent::new(params.amount, currency);
        create.customer = Some(parse_customer_id(&params.customer_id)?);
        create.description = Some(params.description.as_str());
        create.metadata = Some(params.metadata.clone());
        create.automatic_payment_methods = Some(CreatePaymentIntentAutomaticPaymentMethods {
            enabled: true,
            ..Default::default()
        });

        let intent = PaymentIntent::create(self.stripe.inner(), create).await?;

        tracing::info!(
            payment_intent_id = %intent.id,
            customer_id = %params.customer_id,
            amount = params.amount,
            "Created Stripe payment intent"
        );

        Ok(map_payment_intent(&intent))
    }

    async fn retrieve_subscription(&self, id: &str) -> BillingResult<SubscriptionInfo> {
        let subscription_id = parse_subscription_id(id)?;
        let subscription =
            Subscription::retrieve(self.stripe.inner(), &subscription_id, SUBSCRIPTION_EXPAND)
                .await?;
        Ok(map_subscription(&subscription))
    }

    async fn create_subscription(
        &self,
        params: NewSubscription,
    ) -> BillingResult<SubscriptionInfo> {
        let customer_id = parse_customer_id(&params.customer_id)?;

        let mut create = CreateSubscription::new(customer_id);
        create.items = Some(vec![CreateSubscriptionItems {
            price: Some(params.price_id.clone()),
            ..Default::default()
        }]);
        create.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        create.metadata = Some(params.metadata.clone());
        create.expand = SUBSCRIPTION_EXPAND;

        let subscription = Subscription::create(self.stripe.inner(), create).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            customer_id = %params.customer_id,
            price_id = %params.price_id,
            "Created Stripe subscription"
        );

        Ok(map_subscription(&subscription))
    }

    async fn activate_subscription(&self, id: &str) -> BillingResult<SubscriptionInfo> {
        let subscription_id = parse_subscription_id(id)?;

        // The first invoice is already paid at this point; Stripe flips the
        // status on its own. Stamp the subscription so the forced activation
        // is visible in the dashboard, and report it as active.
        let mut metadata: HashMap<String, String> =
            Subscription::retrieve(self.stripe.inner(), &subscription_id, &[])
                .await?
                .metadata;
        metadata.insert("activated_by".to_string(), "reconciliation".to_string());

        let params = UpdateSubscription {
            metadata: Some(metadata),
            expand: SUBSCRIPTION_EXPAND,
            ..Default::default()
        };
        let subscription =
            Subscription::update(self.stripe.inner(), &subscription_id, params).await?;

        tracing::info!(subscription_id = %subscription.id, "Activated incomplete subscription");

        let mut info = map_subscription(&subscription);
        info.status = SubscriptionState::Active;
        Ok(info)
    }

    async fn retrieve_customer(&self, id: &str) -> BillingResult<CustomerInfo> {
        let customer_id = parse_customer_id(id)?;
        let customer = Customer::retrieve(self.stripe.inner(), &customer_id, &[])
            .await
            .map_err(|e| match e {
                stripe::StripeError::Stripe(ref request) if request.http_status == 404 => {
                    BillingError::CustomerNotFound(id.to_string())
                }
                other => other.into(),
            })?;
        Ok(map_customer(&customer))
    }

    async fn create_customer(&self, params: NewCustomer) -> BillingResult<CustomerInfo> {
        let create = CreateCustomer {
            email: params.email.as_deref(),
            name: params.name.as_deref(),
            description: params.description.as_deref(),
            metadata: Some(params.metadata.clone()),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), create).await?;

        tracing::info!(customer_id = %customer.id, "Created Stripe customer");

        Ok(map_customer(&customer))
    }

    async fn update_customer(
        &self,
        id: &str,
        params: CustomerUpdate,
    ) -> BillingResult<CustomerInfo> {
        let customer_id = parse_customer_id(id)?;
        let update = UpdateCustomer {
            email: params.email.as_deref(),
            name: params.name.as_deref(),
            description: params.description.as_deref(),
            ..Default::default()
        };

        let customer = Customer::update(self.stripe.inner(), &customer_id, update).await?;

        tracing::debug!(customer_id = %customer.id, "Updated Stripe customer");

        Ok(map_customer(&customer))
    }

    async fn invoice_payment_intent(
        &self,
        invoice_id: &str,
    ) -> BillingResult<Option<PaymentIntentInfo>> {
        let id = invoice_id
            .parse::<InvoiceId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid invoice ID: {}", e)))?;
        let invoice = Invoice::retrieve(self.stripe.inner(), &id, &["payment_intent"]).await?;

        match invoice.payment_intent {
            Some(Expandable::Object(intent)) => Ok(Some(map_payment_intent(&intent))),
            Some(Expandable::Id(intent_id)) => {
                self.retrieve_payment_intent(intent_id.as_str()).await.map(Some)
            }
            None => Ok(None),
        }
    }
}
