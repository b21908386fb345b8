//! Reconciliation engine
//!
//! Turns a payment intent or subscription reference into an entitlement
//! change, applied at most once no matter how many callers (client polls,
//! webhook deliveries, manual retries) race to apply it.
//!
//! The decision logic lives in pure functions ([`decide_activation`],
//! [`renewal_date_for`], [`apply_activation`]) so the stores can re-run it
//! against the row they hold locked.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use wedmatch_shared::{PlanKind, RenewalPolicy, SubscriptionStatus};

use crate::commission::CommissionEvent;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, PaymentIntentInfo, PaymentIntentState, SubscriptionInfo, SubscriptionState,
    METADATA_PLAN_NAME, METADATA_USER_ID,
};
use crate::store::{
    Activation, ActivationOutcome, EntitlementRecord, EntitlementStore, NewPaymentHistory,
    Renewal,
};

/// Reconcile a charge for a member
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    #[serde(default)]
    pub payment_intent_id: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    pub user_id: Uuid,
    pub plan_name: String,
    /// Price as shown to the member, e.g. "$9.99/month"
    #[serde(default)]
    pub plan_price: String,
    #[serde(default)]
    pub requests_override: Option<i32>,
}

/// Which provider object a reconcile call is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeReference {
    PaymentIntent(String),
    Subscription(String),
}

impl ChargeReference {
    pub fn is_subscription(&self) -> bool {
        matches!(self, ChargeReference::Subscription(_))
    }

    pub fn id(&self) -> &str {
        match self {
            ChargeReference::PaymentIntent(id) | ChargeReference::Subscription(id) => id,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ReconcileRequest {
    /// The subscription reference wins when both are present
    pub fn reference(&self) -> BillingResult<ChargeReference> {
        if let Some(id) = non_empty(&self.subscription_id) {
            return Ok(ChargeReference::Subscription(id.to_string()));
        }
        if let Some(id) = non_empty(&self.payment_intent_id) {
            return Ok(ChargeReference::PaymentIntent(id.to_string()));
        }
        Err(BillingError::InvalidInput(
            "either paymentIntentId or subscriptionId is required".to_string(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub applied: bool,
    pub already_processed: bool,
    pub is_subscription: bool,
    /// Provider status of the charge when it has not succeeded yet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_status: Option<String>,
}

impl ReconcileOutcome {
    fn pending(is_subscription: bool, status: &str) -> Self {
        Self {
            applied: false,
            already_processed: false,
            is_subscription,
            pending_status: Some(status.to_string()),
        }
    }

    /// The entitlement is in place (now or from an earlier call)
    pub fn is_success(&self) -> bool {
        self.applied || self.already_processed
    }

    pub fn message(&self) -> String {
        if self.applied {
            "Payment confirmed and plan activated".to_string()
        } else if self.already_processed {
            "Payment already processed".to_string()
        } else {
            format!(
                "Payment not yet confirmed (status: {})",
                self.pending_status.as_deref().unwrap_or("unknown")
            )
        }
    }
}

/// Wire shape of a reconcile answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub success: bool,
    #[serde(default)]
    pub already_processed: bool,
    #[serde(default)]
    pub is_subscription: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl From<&ReconcileOutcome> for ReconcileResponse {
    fn from(outcome: &ReconcileOutcome) -> Self {
        Self {
            success: outcome.is_success(),
            already_processed: outcome.already_processed,
            is_subscription: outcome.is_subscription,
            message: Some(outcome.message()),
            status: outcome.pending_status.clone(),
        }
    }
}

impl From<ReconcileResponse> for ReconcileOutcome {
    fn from(response: ReconcileResponse) -> Self {
        Self {
            applied: response.success && !response.already_processed,
            already_processed: response.already_processed,
            is_subscription: response.is_subscription,
            pending_status: if response.success {
                None
            } else {
                Some(response.status.unwrap_or_else(|| "unknown".to_string()))
            },
        }
    }
}

// =============================================================================
// Decision logic
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationDecision {
    AlreadyApplied,
    Apply { overwrite_quota: bool },
}

/// The record already reflects this activation
pub fn is_already_applied(current: &EntitlementRecord, activation: &Activation) -> bool {
    if !current.is_active() || current.subscription_plan != activation.plan {
        return false;
    }
    match activation.subscription_id.as_deref() {
        Some(subscription_id) => current.subscription_id.as_deref() == Some(subscription_id),
        None => activation.plan.is_one_time(),
    }
}

/// Whether an activation may replace the remaining allowance. An allowance
/// already running for the same active plan is kept unless it is empty.
pub fn should_overwrite_quota(current: &EntitlementRecord, plan: PlanKind) -> bool {
    let same_active_plan = current.is_active() && current.subscription_plan == plan;
    !same_active_plan || current.requests_remaining.unwrap_or(0) == 0
}

/// Decide what an activation does to the current record.
///
/// `charge_recorded` is true when the charge's payment reference is already
/// in the payment history, which catches repeats of plans that can be bought
/// more than once.
pub fn decide_activation(
    current: &EntitlementRecord,
    activation: &Activation,
    charge_recorded: bool,
) -> ActivationDecision {
    if charge_recorded || is_already_applied(current, activation) {
        return ActivationDecision::AlreadyApplied;
    }
    ActivationDecision::Apply {
        overwrite_quota: should_overwrite_quota(current, activation.plan),
    }
}

/// Renewal date for a confirmed purchase: the provider's period end for
/// subscriptions, otherwise the plan's one-time policy
pub fn renewal_date_for(
    plan: PlanKind,
    subscription_period_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    if subscription_period_end.is_some() {
        return subscription_period_end;
    }
    match plan.one_time_renewal() {
        RenewalPolicy::Perpetual => None,
        RenewalPolicy::FixedDays(days) => Some(now + time::Duration::days(days)),
    }
}

/// Write an activation into a record
pub fn apply_activation(record: &mut EntitlementRecord, activation: &Activation, overwrite_quota: bool) {
    record.subscription_status = SubscriptionStatus::Active;
    record.subscription_plan = activation.plan;
    record.subscription_id = activation.subscription_id.clone();
    if record.billing_customer_id.is_none() {
        record.billing_customer_id = Some(activation.billing_customer_id.clone());
    }
    record.renewal_date = activation.renewal_date;
    record.is_canceled = false;
    record.has_received_initial_allocation = true;
    if overwrite_quota {
        record.requests_remaining = Some(activation.requests);
    }
}

/// A renewal only touches the record while the member still holds that
/// subscription (or none at all)
pub fn renewal_applies(current: &EntitlementRecord, renewal: &Renewal) -> bool {
    match current.subscription_id.as_deref() {
        Some(held) => held == renewal.subscription_id,
        None => true,
    }
}

/// Pick the plan to grant. The plan recorded on the charge wins; the caller's
/// plan name only matters for charges that carry no plan of their own.
pub fn resolve_plan(requested: &str, charged: Option<PlanKind>) -> BillingResult<PlanKind> {
    match (charged, PlanKind::lookup(requested)) {
        (Some(charged), Some(requested)) if charged != requested => {
            Err(BillingError::InvalidInput(format!(
                "plan {} does not match the charge ({})",
                requested, charged
            )))
        }
        (Some(charged), _) => Ok(charged),
        (None, _) => Ok(PlanKind::from_name(requested)),
    }
}

/// Requests granted by an activation; unlimited plans ignore overrides
pub fn granted_requests(plan: PlanKind, requests_override: Option<i32>) -> i32 {
    match requests_override {
        Some(requests) if !plan.is_unlimited() => requests,
        _ => plan.monthly_requests(),
    }
}

/// Write a renewal into a record; the allowance is always replenished
pub fn apply_renewal(record: &mut EntitlementRecord, renewal: &Renewal) {
    record.subscription_status = SubscriptionStatus::Active;
    record.subscription_plan = renewal.plan;
    record.subscription_id = Some(renewal.subscription_id.clone());
    record.requests_remaining = Some(renewal.requests);
    record.renewal_date = renewal.renewal_date;
    record.is_canceled = false;
}

/// History description for a plan purchase
pub fn plan_description(plan: PlanKind, price_display: &str) -> String {
    let price = price_display.trim();
    if price.is_empty() {
        plan.display_name().to_string()
    } else {
        format!("{} ({})", plan.display_name(), price)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// A charge as confirmed by the provider
#[derive(Debug, Clone)]
struct VerifiedCharge {
    succeeded: bool,
    status: String,
    customer_id: Option<String>,
    subscription_id: Option<String>,
    period_end: Option<OffsetDateTime>,
    amount_cents: i64,
    currency: String,
    payment_reference: String,
    metadata: HashMap<String, String>,
    price_id: Option<String>,
}

impl VerifiedCharge {
    fn from_payment_intent(intent: &PaymentIntentInfo) -> Self {
        Self {
            succeeded: intent.status.counts_as_success(),
            status: intent.status.as_str().to_string(),
            customer_id: intent.customer_id.clone(),
            subscription_id: None,
            period_end: None,
            amount_cents: intent.amount,
            currency: intent.currency.clone(),
            payment_reference: intent.id.clone(),
            metadata: intent.metadata.clone(),
            price_id: None,
        }
    }

    fn from_subscription(
        subscription: &SubscriptionInfo,
        payment: Option<&PaymentIntentInfo>,
        succeeded: bool,
    ) -> Self {
        Self {
            succeeded,
            status: subscription.status.as_str().to_string(),
            customer_id: Some(subscription.customer_id.clone()),
            subscription_id: Some(subscription.id.clone()),
            period_end: subscription.current_period_end,
            amount_cents: payment.map(|p| p.amount).unwrap_or(0),
            currency: payment
                .map(|p| p.currency.clone())
                .unwrap_or_else(|| "usd".to_string()),
            payment_reference: payment
                .map(|p| p.id.clone())
                .unwrap_or_else(|| subscription.id.clone()),
            metadata: subscription.metadata.clone(),
            price_id: subscription.price_id.clone(),
        }
    }
}

/// Applies confirmed charges to member entitlements
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn EntitlementStore>,
    provider: Arc<dyn BillingProvider>,
    customers: CustomerService,
    price_plans: Arc<HashMap<String, PlanKind>>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn EntitlementStore>, provider: Arc<dyn BillingProvider>) -> Self {
        let customers = CustomerService::new(store.clone(), provider.clone());
        Self {
            store,
            provider,
            customers,
            price_plans: Arc::new(HashMap::new()),
        }
    }

    /// Recognize plans by recurring price id when metadata is missing
    pub fn with_price_plans(mut self, price_plans: HashMap<String, PlanKind>) -> Self {
        self.price_plans = Arc::new(price_plans);
        self
    }

    /// Plan recorded on a provider object: plan metadata first, then price id
    pub fn plan_for_charge(
        &self,
        metadata: &HashMap<String, String>,
        price_id: Option<&str>,
    ) -> Option<PlanKind> {
        metadata
            .get(METADATA_PLAN_NAME)
            .and_then(|name| PlanKind::lookup(name))
            .or_else(|| price_id.and_then(|id| self.price_plans.get(id).copied()))
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn BillingProvider> {
        &self.provider
    }

    pub fn customers(&self) -> &CustomerService {
        &self.customers
    }

    /// Verify a charge with the provider and apply it to the member's
    /// entitlement if it has not been applied yet.
    ///
    /// A charge that has not succeeded yet is not an error: the outcome comes
    /// back with `applied == false` and nothing is written.
    pub async fn reconcile(&self, request: &ReconcileRequest) -> BillingResult<ReconcileOutcome> {
        let reference = request.reference()?;
        let user_id = request.user_id;

        let charge = match &reference {
            ChargeReference::PaymentIntent(id) => self.verify_payment_intent(id, user_id).await?,
            ChargeReference::Subscription(id) => self.verify_subscription(id, user_id).await?,
        };

        let plan = resolve_plan(
            &request.plan_name,
            self.plan_for_charge(&charge.metadata, charge.price_id.as_deref()),
        )?;

        if !charge.succeeded {
            tracing::info!(
                user_id = %user_id,
                reference = %reference.id(),
                status = %charge.status,
                "Charge not confirmed yet"
            );
            return Ok(ReconcileOutcome::pending(reference.is_subscription(), &charge.status));
        }

        let billing_customer_id = self
            .customers
            .ensure_customer(user_id, charge.customer_id.as_deref())
            .await?;

        let requests = granted_requests(plan, request.requests_override);
        let renewal_date = renewal_date_for(plan, charge.period_end, OffsetDateTime::now_utc());

        let activation = Activation {
            user_id,
            plan,
            subscription_id: charge.subscription_id.clone(),
            billing_customer_id,
            requests,
            renewal_date,
            history: NewPaymentHistory {
                amount_cents: charge.amount_cents,
                currency: charge.currency.clone(),
                plan_description: plan_description(plan, &request.plan_price),
                payment_reference: Some(charge.payment_reference.clone()),
                status: "succeeded".to_string(),
            },
        };

        match self.store.commit_activation(&activation).await? {
            ActivationOutcome::AlreadyProcessed => {
                tracing::info!(
                    user_id = %user_id,
                    plan = %plan,
                    reference = %reference.id(),
                    "Charge already applied"
                );
                Ok(ReconcileOutcome {
                    applied: false,
                    already_processed: true,
                    is_subscription: reference.is_subscription(),
                    pending_status: None,
                })
            }
            ActivationOutcome::Applied { quota_overwritten } => {
                tracing::info!(
                    user_id = %user_id,
                    plan = %plan,
                    reference = %reference.id(),
                    requests = requests,
                    quota_overwritten = quota_overwritten,
                    "Applied entitlement for confirmed charge"
                );
                self.publish_commission(&activation).await;
                Ok(ReconcileOutcome {
                    applied: true,
                    already_processed: false,
                    is_subscription: reference.is_subscription(),
                    pending_status: None,
                })
            }
        }
    }

    /// Reject charges made for another member.
    ///
    /// The member id stamped on the charge decides. Charges without one are
    /// matched by customer: the member's linked customer, or for unlinked
    /// members whoever the customer resolves to.
    async fn ensure_charge_owner(
        &self,
        user_id: Uuid,
        reference: &str,
        charge: &VerifiedCharge,
    ) -> BillingResult<()> {
        let owner = match charge.metadata.get(METADATA_USER_ID) {
            Some(owner) => Uuid::parse_str(owner.trim()).ok(),
            None => match charge.customer_id.as_deref() {
                None => return Ok(()),
                Some(customer_id) => {
                    let linked = self
                        .store
                        .load_profile(user_id)
                        .await?
                        .and_then(|profile| profile.billing_customer_id);
                    match linked {
                        Some(linked) if linked == customer_id => return Ok(()),
                        Some(_) => None,
                        None => match self.customers.user_for_customer(customer_id).await? {
                            Some(owner) => Some(owner),
                            None => return Ok(()),
                        },
                    }
                }
            },
        };

        if owner == Some(user_id) {
            return Ok(());
        }

        tracing::warn!(
            user_id = %user_id,
            reference = %reference,
            owner = ?owner,
            customer_id = ?charge.customer_id,
            "SECURITY: reconcile attempted for another member's charge"
        );
        Err(BillingError::Unauthorized(
            "charge belongs to a different member".to_string(),
        ))
    }

    async fn verify_payment_intent(&self, id: &str, user_id: Uuid) -> BillingResult<VerifiedCharge> {
        let intent = self.provider.retrieve_payment_intent(id).await?;
        let charge = VerifiedCharge::from_payment_intent(&intent);
        self.ensure_charge_owner(user_id, id, &charge).await?;
        Ok(charge)
    }

    async fn verify_subscription(&self, id: &str, user_id: Uuid) -> BillingResult<VerifiedCharge> {
        let subscription = self.provider.retrieve_subscription(id).await?;

        let payment = match subscription.latest_payment_intent.clone() {
            Some(intent) => Some(intent),
            None => match subscription.latest_invoice_id.as_deref() {
                Some(invoice_id) => self.provider.invoice_payment_intent(invoice_id).await?,
                None => None,
            },
        };

        // Checked before anything is changed on the provider side
        let unconfirmed = VerifiedCharge::from_subscription(&subscription, payment.as_ref(), false);
        self.ensure_charge_owner(user_id, id, &unconfirmed).await?;

        if subscription.status.is_active() {
            return Ok(VerifiedCharge {
                succeeded: true,
                ..unconfirmed
            });
        }

        let first_payment_succeeded = payment
            .as_ref()
            .map(|p| p.status == PaymentIntentState::Succeeded)
            .unwrap_or(false);

        if subscription.status == SubscriptionState::Incomplete
            && first_payment_succeeded
        {
            let activated = self.provider.activate_subscription(id).await?;
            tracing::info!(
                subscription_id = %id,
                "First invoice paid, activated incomplete subscription"
            );
            return Ok(VerifiedCharge::from_subscription(&activated, payment.as_ref(), true));
        }

        Ok(unconfirmed)
    }

    /// Queue a referral commission for a member's first purchase. Failures
    /// never fail the reconciliation.
    async fn publish_commission(&self, activation: &Activation) {
        let profile = match self.store.load_profile(activation.user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    user_id = %activation.user_id,
                    error = %e,
                    "Failed to load profile for referral commission"
                );
                return;
            }
        };

        let Some(referral_code) = profile.pending_referral_code else {
            return;
        };

        let event = CommissionEvent {
            id: Uuid::new_v4(),
            user_id: activation.user_id,
            referral_code,
            plan_name: activation.plan.display_name().to_string(),
            amount_cents: activation.history.amount_cents,
            currency: activation.history.currency.clone(),
            payment_reference: activation.history.payment_reference.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        match self.store.enqueue_commission(&event).await {
            Ok(()) => tracing::info!(
                user_id = %activation.user_id,
                referral_code = %event.referral_code,
                "Queued referral commission"
            ),
            Err(e) => tracing::error!(
                user_id = %activation.user_id,
                referral_code = %event.referral_code,
                error = %e,
                "Failed to queue referral commission"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activation(plan: PlanKind, subscription_id: Option<&str>) -> Activation {
        Activation {
            user_id: Uuid::nil(),
            plan,
            subscription_id: subscription_id.map(str::to_string),
            billing_customer_id: "cus_1".to_string(),
            requests: plan.monthly_requests(),
            renewal_date: None,
            history: NewPaymentHistory {
                amount_cents: 999,
                currency: "usd".to_string(),
                plan_description: plan.display_name().to_string(),
                payment_reference: Some("pi_1".to_string()),
                status: "succeeded".to_string(),
            },
        }
    }

    fn active(plan: PlanKind, subscription_id: Option<&str>, requests: i32) -> EntitlementRecord {
        let mut record = EntitlementRecord::new(Uuid::nil());
        record.subscription_status = SubscriptionStatus::Active;
        record.subscription_plan = plan;
        record.subscription_id = subscription_id.map(str::to_string);
        record.requests_remaining = Some(requests);
        record
    }

    #[test]
    fn test_reference_prefers_subscription() {
        let request = ReconcileRequest {
            payment_intent_id: Some("pi_1".to_string()),
            subscription_id: Some("sub_1".to_string()),
            ..Default::default()
        };
        assert_eq!(
            request.reference().unwrap(),
            ChargeReference::Subscription("sub_1".to_string())
        );
    }

    #[test]
    fn test_reference_requires_one_id() {
        let request = ReconcileRequest {
            subscription_id: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(matches!(request.reference(), Err(BillingError::InvalidInput(_))));
    }

    #[test]
    fn test_same_subscription_is_already_applied() {
        let current = active(PlanKind::Monthly, Some("sub_1"), 7);
        assert!(is_already_applied(&current, &activation(PlanKind::Monthly, Some("sub_1"))));
        assert!(!is_already_applied(&current, &activation(PlanKind::Monthly, Some("sub_2"))));
        assert!(!is_already_applied(&current, &activation(PlanKind::Premium, Some("sub_1"))));
    }

    #[test]
    fn test_one_time_plan_is_already_applied_without_subscription() {
        let current = active(PlanKind::Unlimited, None, 999_999);
        assert!(is_already_applied(&current, &activation(PlanKind::Unlimited, None)));
        assert!(!is_already_applied(&current, &activation(PlanKind::UnlimitedPromo, None)));
    }

    #[test]
    fn test_inactive_record_is_never_already_applied() {
        let mut current = active(PlanKind::Monthly, Some("sub_1"), 10);
        current.subscription_status = SubscriptionStatus::Inactive;
        assert!(!is_already_applied(&current, &activation(PlanKind::Monthly, Some("sub_1"))));
    }

    #[test]
    fn test_quota_preserved_for_running_allowance() {
        let current = active(PlanKind::Monthly, Some("sub_1"), 4);
        assert!(!should_overwrite_quota(&current, PlanKind::Monthly));
        assert!(should_overwrite_quota(&current, PlanKind::Premium));

        let exhausted = active(PlanKind::Monthly, Some("sub_1"), 0);
        assert!(should_overwrite_quota(&exhausted, PlanKind::Monthly));

        let mut legacy = active(PlanKind::Monthly, Some("sub_1"), 0);
        legacy.requests_remaining = None;
        assert!(should_overwrite_quota(&legacy, PlanKind::Monthly));
    }

    #[test]
    fn test_recorded_charge_short_circuits() {
        let current = EntitlementRecord::new(Uuid::nil());
        assert_eq!(
            decide_activation(&current, &activation(PlanKind::Monthly, None), true),
            ActivationDecision::AlreadyApplied
        );
        assert_eq!(
            decide_activation(&current, &activation(PlanKind::Monthly, None), false),
            ActivationDecision::Apply { overwrite_quota: true }
        );
    }

    #[test]
    fn test_charged_plan_wins_over_requested_name() {
        assert_eq!(
            resolve_plan("Monthly Plan", Some(PlanKind::Monthly)).unwrap(),
            PlanKind::Monthly
        );
        assert_eq!(resolve_plan("", Some(PlanKind::Premium)).unwrap(), PlanKind::Premium);
        assert_eq!(
            resolve_plan("Gold Plan", Some(PlanKind::Premium)).unwrap(),
            PlanKind::Premium
        );
        assert!(matches!(
            resolve_plan("Unlimited Plan", Some(PlanKind::Monthly)),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_requested_name_used_only_without_charged_plan() {
        assert_eq!(resolve_plan("premium", None).unwrap(), PlanKind::Premium);
        assert_eq!(resolve_plan("Gold Plan", None).unwrap(), PlanKind::Free);
    }

    #[test]
    fn test_override_never_replaces_unlimited_sentinel() {
        assert_eq!(granted_requests(PlanKind::Monthly, None), 10);
        assert_eq!(granted_requests(PlanKind::Monthly, Some(25)), 25);
        assert_eq!(granted_requests(PlanKind::Unlimited, Some(25)), 999_999);
        assert_eq!(granted_requests(PlanKind::UnlimitedPromo, Some(0)), 999_999);
    }

    #[test]
    fn test_renewal_scoped_to_held_subscription() {
        let renewal = Renewal {
            user_id: Uuid::nil(),
            plan: PlanKind::Monthly,
            subscription_id: "sub_old".to_string(),
            requests: 10,
            renewal_date: None,
            history: activation(PlanKind::Monthly, None).history,
        };

        assert!(renewal_applies(&active(PlanKind::Monthly, Some("sub_old"), 2), &renewal));
        assert!(renewal_applies(&EntitlementRecord::new(Uuid::nil()), &renewal));
        assert!(!renewal_applies(&active(PlanKind::Premium, Some("sub_new"), 15), &renewal));
    }

    #[test]
    fn test_renewal_dates() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let period_end = now + time::Duration::days(31);

        assert_eq!(renewal_date_for(PlanKind::Monthly, Some(period_end), now), Some(period_end));
        assert_eq!(renewal_date_for(PlanKind::Unlimited, None, now), None);
        assert_eq!(renewal_date_for(PlanKind::UnlimitedPromo, None, now), None);
        assert_eq!(
            renewal_date_for(PlanKind::Monthly, None, now),
            Some(now + time::Duration::days(30))
        );
    }

    #[test]
    fn test_apply_activation_keeps_linked_customer() {
        let mut record = EntitlementRecord::new(Uuid::nil());
        record.billing_customer_id = Some("cus_original".to_string());
        record.is_canceled = true;

        apply_activation(&mut record, &activation(PlanKind::Monthly, Some("sub_1")), true);

        assert_eq!(record.billing_customer_id.as_deref(), Some("cus_original"));
        assert_eq!(record.subscription_status, SubscriptionStatus::Active);
        assert_eq!(record.requests_remaining, Some(10));
        assert!(!record.is_canceled);
        assert!(record.has_received_initial_allocation);
    }

    #[test]
    fn test_plan_description() {
        assert_eq!(plan_description(PlanKind::Monthly, "$9.99"), "Monthly Plan ($9.99)");
        assert_eq!(plan_description(PlanKind::Premium, " "), "Premium Plan");
    }

    #[test]
    fn test_response_round_trips_pending_status() {
        let outcome = ReconcileOutcome::pending(true, "incomplete");
        let response = ReconcileResponse::from(&outcome);
        assert!(!response.success);
        assert_eq!(response.status.as_deref(), Some("incomplete"));
        assert_eq!(
            response.message.as_deref(),
            Some("Payment not yet confirmed (status: incomplete)")
        );
        assert_eq!(ReconcileOutcome::from(response), outcome);

        let done: ReconcileOutcome = serde_json::from_value::<ReconcileResponse>(
            serde_json::json!({"success": true, "alreadyProcessed": true}),
        )
        .unwrap()
        .into();
        assert!(done.already_processed);
        assert!(!done.applied);
        assert!(done.pending_status.is_none());
    }
}
