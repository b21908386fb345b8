//! Entitlement store
//!
//! Per-member entitlement state plus the append-only payment history. The
//! store is the only place cross-request state lives: the activation and
//! renewal primitives lock the member's row, re-check idempotence against the
//! locked state and write the entitlement and the history row in one
//! transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;
use wedmatch_shared::{PlanKind, SubscriptionStatus};

use crate::commission::CommissionEvent;
use crate::error::BillingResult;

pub use self::memory::InMemoryEntitlementStore;
pub use self::postgres::PgEntitlementStore;

/// One member's entitlement state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementRecord {
    pub user_id: Uuid,
    pub subscription_status: SubscriptionStatus,
    pub subscription_plan: PlanKind,
    pub subscription_id: Option<String>,
    pub billing_customer_id: Option<String>,
    /// `None` for rows created before quotas existed
    pub requests_remaining: Option<i32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub renewal_date: Option<OffsetDateTime>,
    pub is_canceled: bool,
    pub has_received_initial_allocation: bool,
}

impl EntitlementRecord {
    /// Defaults written at signup
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            subscription_status: SubscriptionStatus::Inactive,
            subscription_plan: PlanKind::Free,
            subscription_id: None,
            billing_customer_id: None,
            requests_remaining: Some(0),
            renewal_date: None,
            is_canceled: false,
            has_received_initial_allocation: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscription_status == SubscriptionStatus::Active
    }
}

/// Profile fields the billing pipeline reads alongside the entitlement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberProfile {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub billing_customer_id: Option<String>,
    /// Referral code entered at signup that has not earned a commission yet
    pub pending_referral_code: Option<String>,
}

/// A recorded charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentHistoryEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub plan_description: String,
    pub payment_reference: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// History row to be written with an entitlement change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPaymentHistory {
    pub amount_cents: i64,
    pub currency: String,
    pub plan_description: String,
    pub payment_reference: Option<String>,
    pub status: String,
}

impl NewPaymentHistory {
    pub fn into_entry(self, user_id: Uuid, created_at: OffsetDateTime) -> PaymentHistoryEntry {
        PaymentHistoryEntry {
            id: Uuid::new_v4(),
            user_id,
            amount_cents: self.amount_cents,
            currency: self.currency,
            plan_description: self.plan_description,
            payment_reference: self.payment_reference,
            status: self.status,
            created_at,
        }
    }
}

/// Entitlement change for a newly confirmed purchase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub user_id: Uuid,
    pub plan: PlanKind,
    /// Provider subscription for recurring purchases
    pub subscription_id: Option<String>,
    pub billing_customer_id: String,
    pub requests: i32,
    pub renewal_date: Option<OffsetDateTime>,
    pub history: NewPaymentHistory,
}

/// Entitlement change for a paid renewal invoice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renewal {
    pub user_id: Uuid,
    pub plan: PlanKind,
    pub subscription_id: String,
    pub requests: i32,
    pub renewal_date: Option<OffsetDateTime>,
    pub history: NewPaymentHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    Applied { quota_overwritten: bool },
    AlreadyProcessed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    Applied,
    /// The member moved to another subscription; only the charge was recorded
    Superseded,
}

/// Result of trying to claim a provider event for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClaim {
    Claimed,
    /// Already handled, or being handled elsewhere
    Duplicate { status: String },
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn load(&self, user_id: Uuid) -> BillingResult<Option<EntitlementRecord>>;

    async fn load_profile(&self, user_id: Uuid) -> BillingResult<Option<MemberProfile>>;

    /// Link a provider customer to the member. Never overwrites an existing
    /// link; returns the id that is linked afterwards.
    async fn link_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<String>;

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>>;

    /// Apply an activation exactly once. Locks the member's row, re-checks
    /// idempotence against the locked state, then writes the entitlement and
    /// the history row together.
    async fn commit_activation(&self, activation: &Activation) -> BillingResult<ActivationOutcome>;

    /// Replenish the allowance for a new billing period and record the charge.
    /// The entitlement is left alone when the member holds a different
    /// subscription than the one renewed.
    async fn commit_renewal(&self, renewal: &Renewal) -> BillingResult<RenewalOutcome>;

    /// Deactivate whichever member currently holds this subscription.
    /// Returns the number of members affected.
    async fn deactivate_subscription(&self, subscription_id: &str) -> BillingResult<u64>;

    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<EventClaim>;

    async fn finish_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()>;

    /// History entries, newest first
    async fn list_history(
        &self,
        user_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentHistoryEntry>>;

    /// Append a commission event to the outbox
    async fn enqueue_commission(&self, event: &CommissionEvent) -> BillingResult<()>;
}
