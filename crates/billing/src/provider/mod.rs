//! Billing provider adapter
//!
//! The reconciliation engine and webhook ingestor talk to the payment
//! provider only through [`BillingProvider`]. Provider objects are mapped to
//! the small neutral types below so business logic never depends on the
//! provider SDK's object model.

pub mod memory;
pub mod stripe_provider;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;

pub use self::memory::InMemoryBillingProvider;
pub use self::stripe_provider::StripeBillingProvider;

/// Metadata key carrying the member id on provider objects
pub const METADATA_USER_ID: &str = "user_id";
/// Metadata key carrying the plan display name on provider objects
pub const METADATA_PLAN_NAME: &str = "plan_name";

/// Payment intent status as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentIntentState {
    Succeeded,
    Processing,
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    RequiresCapture,
    Canceled,
    Other(String),
}

impl PaymentIntentState {
    pub fn from_provider(status: &str) -> Self {
        match status {
            "succeeded" => Self::Succeeded,
            "processing" => Self::Processing,
            "requires_payment_method" => Self::RequiresPaymentMethod,
            "requires_confirmation" => Self::RequiresConfirmation,
            "requires_action" => Self::RequiresAction,
            "requires_capture" => Self::RequiresCapture,
            "canceled" => Self::Canceled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Processing => "processing",
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::RequiresAction => "requires_action",
            Self::RequiresCapture => "requires_capture",
            Self::Canceled => "canceled",
            Self::Other(other) => other,
        }
    }

    /// `processing` is granted optimistically; the webhook is the final word.
    pub fn counts_as_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Processing)
    }
}

/// Subscription status as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    Trialing,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Unpaid,
    Canceled,
    Paused,
    Other(String),
}

impl SubscriptionState {
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "past_due" => Self::PastDue,
            "unpaid" => Self::Unpaid,
            "canceled" => Self::Canceled,
            "paused" => Self::Paused,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Canceled => "canceled",
            Self::Paused => "paused",
            Self::Other(other) => other,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentInfo {
    pub id: String,
    pub status: PaymentIntentState,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    pub customer_id: Option<String>,
    pub client_secret: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub status: SubscriptionState,
    pub customer_id: String,
    pub current_period_end: Option<OffsetDateTime>,
    pub price_id: Option<String>,
    pub latest_invoice_id: Option<String>,
    /// Payment intent of the latest invoice, when the provider returned it expanded
    pub latest_payment_intent: Option<PaymentIntentInfo>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerInfo {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewCustomer {
    pub email: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CustomerUpdate {
    pub email: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentIntent {
    pub customer_id: String,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub customer_id: String,
    pub price_id: String,
    pub metadata: HashMap<String, String>,
}

/// Operations the pipeline needs from the payment provider
#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn retrieve_payment_intent(&self, id: &str) -> BillingResult<PaymentIntentInfo>;

    async fn create_payment_intent(&self, params: NewPaymentIntent)
        -> BillingResult<PaymentIntentInfo>;

    /// Retrieve a subscription with its latest invoice's payment intent expanded
    async fn retrieve_subscription(&self, id: &str) -> BillingResult<SubscriptionInfo>;

    /// Create a subscription in the default-incomplete state; the first
    /// invoice's payment intent is returned for client-side confirmation
    async fn create_subscription(&self, params: NewSubscription)
        -> BillingResult<SubscriptionInfo>;

    /// Mark an incomplete subscription whose first payment already succeeded
    /// as activated
    async fn activate_subscription(&self, id: &str) -> BillingResult<SubscriptionInfo>;

    async fn retrieve_customer(&self, id: &str) -> BillingResult<CustomerInfo>;

    async fn create_customer(&self, params: NewCustomer) -> BillingResult<CustomerInfo>;

    async fn update_customer(&self, id: &str, params: CustomerUpdate)
        -> BillingResult<CustomerInfo>;

    /// Payment intent attached to an invoice, if any
    async fn invoice_payment_intent(&self, invoice_id: &str)
        -> BillingResult<Option<PaymentIntentInfo>>;
}
