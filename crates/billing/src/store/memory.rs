//! In-memory entitlement store
//!
//! One async mutex guards all state. `commit_activation` holds it across the
//! idempotence check and the write, which gives the same serialization the
//! Postgres store gets from `SELECT ... FOR UPDATE`.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    Activation, ActivationOutcome, EntitlementRecord, EntitlementStore, EventClaim,
    MemberProfile, PaymentHistoryEntry, Renewal, RenewalOutcome,
};
use crate::commission::CommissionEvent;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{
    apply_activation, apply_renewal, decide_activation, renewal_applies, ActivationDecision,
};

/// Claims stuck in `processing` longer than this may be taken over
const PROCESSING_TIMEOUT: time::Duration = time::Duration::minutes(30);

#[derive(Debug, Clone)]
struct EventRow {
    status: String,
    started_at: OffsetDateTime,
    error: Option<String>,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<Uuid, EntitlementRecord>,
    profiles: HashMap<Uuid, MemberProfile>,
    history: Vec<PaymentHistoryEntry>,
    events: HashMap<String, EventRow>,
    outbox: Vec<CommissionEvent>,
}

#[derive(Default)]
pub struct InMemoryEntitlementStore {
    state: Mutex<StoreState>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a member with signup defaults
    pub async fn insert_member(&self, user_id: Uuid, profile: MemberProfile) {
        let mut state = self.state.lock().await;
        let mut record = EntitlementRecord::new(user_id);
        record.billing_customer_id = profile.billing_customer_id.clone();
        state.records.insert(user_id, record);
        state.profiles.insert(user_id, profile);
    }

    /// Replace a member's entitlement record
    pub async fn insert_record(&self, record: EntitlementRecord) {
        let mut state = self.state.lock().await;
        state.profiles.entry(record.user_id).or_default().billing_customer_id =
            record.billing_customer_id.clone();
        state.records.insert(record.user_id, record);
    }

    pub async fn history_for(&self, user_id: Uuid) -> Vec<PaymentHistoryEntry> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn outbox(&self) -> Vec<CommissionEvent> {
        self.state.lock().await.outbox.clone()
    }

    pub async fn event_status(&self, event_id: &str) -> Option<(String, Option<String>)> {
        self.state
            .lock()
            .await
            .events
            .get(event_id)
            .map(|row| (row.status.clone(), row.error.clone()))
    }
}

fn missing_member(user_id: Uuid) -> BillingError {
    BillingError::NotFound(format!("member {}", user_id))
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn load(&self, user_id: Uuid) -> BillingResult<Option<EntitlementRecord>> {
        Ok(self.state.lock().await.records.get(&user_id).cloned())
    }

    async fn load_profile(&self, user_id: Uuid) -> BillingResult<Option<MemberProfile>> {
        let state = self.state.lock().await;
        let Some(record) = state.records.get(&user_id) else {
            return Ok(None);
        };
        let mut profile = state.profiles.get(&user_id).cloned().unwrap_or_default();
        profile.billing_customer_id = record.billing_customer_id.clone();
        Ok(Some(profile))
    }

    async fn link_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&user_id)
            .ok_or_else(|| missing_member(user_id))?;
        let linked = record
            .billing_customer_id
            .get_or_insert_with(|| customer_id.to_string())
            .clone();
        Ok(linked)
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .values()
            .find(|record| record.billing_customer_id.as_deref() == Some(customer_id))
            .map(|record| record.user_id))
    }

    async fn commit_activation(&self, activation: &Activation) -> BillingResult<ActivationOutcome> {
        let mut state = self.state.lock().await;

        let charge_recorded = activation
            .history
            .payment_reference
            .as_deref()
            .map(|reference| {
                state
                    .history
                    .iter()
                    .any(|entry| {
                        entry.user_id == activation.user_id
                            && entry.payment_reference.as_deref() == Some(reference)
                    })
            })
            .unwrap_or(false);

        let record = state
            .records
            .get_mut(&activation.user_id)
            .ok_or_else(|| missing_member(activation.user_id))?;

        match decide_activation(record, activation, charge_recorded) {
            ActivationDecision::AlreadyApplied => Ok(ActivationOutcome::AlreadyProcessed),
            ActivationDecision::Apply { overwrite_quota } => {
                apply_activation(record, activation, overwrite_quota);
                let entry = activation
                    .history
                    .clone()
                    .into_entry(activation.user_id, OffsetDateTime::now_utc());
                state.history.push(entry);
                Ok(ActivationOutcome::Applied {
                    quota_overwritten: overwrite_quota,
                })
            }
        }
    }

    async fn commit_renewal(&self, renewal: &Renewal) -> BillingResult<RenewalOutcome> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&renewal.user_id)
            .ok_or_else(|| missing_member(renewal.user_id))?;
        let outcome = if renewal_applies(record, renewal) {
            apply_renewal(record, renewal);
            RenewalOutcome::Applied
        } else {
            RenewalOutcome::Superseded
        };
        let entry = renewal
            .history
            .clone()
            .into_entry(renewal.user_id, OffsetDateTime::now_utc());
        state.history.push(entry);
        Ok(outcome)
    }

    async fn deactivate_subscription(&self, subscription_id: &str) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let mut affected = 0;
        for record in state.records.values_mut() {
            if record.subscription_id.as_deref() == Some(subscription_id) {
                record.subscription_status = wedmatch_shared::SubscriptionStatus::Inactive;
                record.subscription_id = None;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn claim_event(&self, event_id: &str, _event_type: &str) -> BillingResult<EventClaim> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(row) = state.events.get_mut(event_id) {
            let stuck = row.status == "processing" && now - row.started_at > PROCESSING_TIMEOUT;
            if row.status == "error" || stuck {
                row.status = "processing".to_string();
                row.started_at = now;
                return Ok(EventClaim::Claimed);
            }
            return Ok(EventClaim::Duplicate {
                status: row.status.clone(),
            });
        }

        state.events.insert(
            event_id.to_string(),
            EventRow {
                status: "processing".to_string(),
                started_at: now,
                error: None,
            },
        );
        Ok(EventClaim::Claimed)
    }

    async fn finish_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        if let Some(row) = self.state.lock().await.events.get_mut(event_id) {
            row.status = if error.is_some() { "error" } else { "success" }.to_string();
            row.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn list_history(
        &self,
        user_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentHistoryEntry>> {
        let mut entries: Vec<PaymentHistoryEntry> = self
            .state
            .lock()
            .await
            .history
            .iter()
            .filter(|entry| {
                entry.user_id == user_id && entry.created_at >= start && entry.created_at <= end
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn enqueue_commission(&self, event: &CommissionEvent) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.outbox.push(event.clone());
        // The referral is consumed by its first commission
        if let Some(profile) = state.profiles.get_mut(&event.user_id) {
            profile.pending_referral_code = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_customer_never_overwrites() {
        let store = InMemoryEntitlementStore::new();
        let user_id = Uuid::new_v4();
        store.insert_member(user_id, MemberProfile::default()).await;

        assert_eq!(store.link_customer(user_id, "cus_first").await.unwrap(), "cus_first");
        assert_eq!(store.link_customer(user_id, "cus_second").await.unwrap(), "cus_first");
        assert_eq!(
            store.find_user_by_customer("cus_first").await.unwrap(),
            Some(user_id)
        );
        assert_eq!(store.find_user_by_customer("cus_second").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_event_claims() {
        let store = InMemoryEntitlementStore::new();

        assert_eq!(store.claim_event("evt_1", "x").await.unwrap(), EventClaim::Claimed);
        assert!(matches!(
            store.claim_event("evt_1", "x").await.unwrap(),
            EventClaim::Duplicate { .. }
        ));

        store.finish_event("evt_1", None).await.unwrap();
        assert_eq!(
            store.claim_event("evt_1", "x").await.unwrap(),
            EventClaim::Duplicate {
                status: "success".to_string()
            }
        );

        store.claim_event("evt_2", "x").await.unwrap();
        store.finish_event("evt_2", Some("provider down")).await.unwrap();
        assert_eq!(store.claim_event("evt_2", "x").await.unwrap(), EventClaim::Claimed);
    }

    #[tokio::test]
    async fn test_missing_member_is_not_found() {
        let store = InMemoryEntitlementStore::new();
        let err = store.link_customer(Uuid::new_v4(), "cus_1").await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
