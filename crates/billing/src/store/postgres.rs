//! Postgres entitlement store
//!
//! Entitlements live on the `profiles` table. Activations and renewals run in
//! a native transaction that locks the member's row with `FOR UPDATE`, so two
//! concurrent reconciles of the same charge serialize and the second one sees
//! the first one's writes.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;
use wedmatch_shared::{PlanKind, SubscriptionStatus};

use super::{
    Activation, ActivationOutcome, EntitlementRecord, EntitlementStore, EventClaim,
    MemberProfile, NewPaymentHistory, PaymentHistoryEntry, Renewal, RenewalOutcome,
};
use crate::commission::CommissionEvent;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{
    apply_activation, apply_renewal, decide_activation, renewal_applies, ActivationDecision,
};

/// Claims stuck in `processing` longer than this may be taken over
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

const ENTITLEMENT_COLUMNS: &str = r#"
    id,
    subscription_status,
    subscription_plan,
    subscription_id,
    stripe_customer_id,
    requests_remaining,
    renewal_date,
    is_canceled,
    has_received_initial_allocation
"#;

#[derive(Debug, sqlx::FromRow)]
struct EntitlementRow {
    id: Uuid,
    subscription_status: Option<String>,
    subscription_plan: Option<String>,
    subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    requests_remaining: Option<i32>,
    renewal_date: Option<OffsetDateTime>,
    is_canceled: Option<bool>,
    has_received_initial_allocation: Option<bool>,
}

impl EntitlementRow {
    fn into_record(self) -> EntitlementRecord {
        let subscription_status = self
            .subscription_status
            .as_deref()
            .unwrap_or_default()
            .parse::<SubscriptionStatus>()
            .unwrap_or_else(|e| {
                tracing::warn!(user_id = %self.id, error = %e, "Unreadable subscription status, treating as inactive");
                SubscriptionStatus::Inactive
            });

        let subscription_plan = match self.subscription_plan.as_deref().map(str::trim) {
            None | Some("") => PlanKind::Free,
            Some(name) => PlanKind::from_name(name),
        };

        EntitlementRecord {
            user_id: self.id,
            subscription_status,
            subscription_plan,
            subscription_id: self.subscription_id,
            billing_customer_id: self.stripe_customer_id,
            requests_remaining: self.requests_remaining,
            renewal_date: self.renewal_date,
            is_canceled: self.is_canceled.unwrap_or(false),
            has_received_initial_allocation: self.has_received_initial_allocation.unwrap_or(false),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    full_name: Option<String>,
    email: Option<String>,
    stripe_customer_id: Option<String>,
    pending_referral_code: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    user_id: Uuid,
    amount_cents: i64,
    currency: String,
    plan_description: String,
    payment_reference: Option<String>,
    status: String,
    created_at: OffsetDateTime,
}

impl From<HistoryRow> for PaymentHistoryEntry {
    fn from(row: HistoryRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            plan_description: row.plan_description,
            payment_reference: row.payment_reference,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

/// Entitlement store backed by the application database
#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_record(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> BillingResult<EntitlementRecord> {
        let row: Option<EntitlementRow> = sqlx::query_as(&format!(
            "SELECT {} FROM profiles WHERE id = $1 FOR UPDATE",
            ENTITLEMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(EntitlementRow::into_record)
            .ok_or_else(|| BillingError::NotFound(format!("member {}", user_id)))
    }

    async fn write_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &EntitlementRecord,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE profiles SET
                subscription_status = $2,
                subscription_plan = $3,
                subscription_id = $4,
                stripe_customer_id = COALESCE(stripe_customer_id, $5),
                requests_remaining = $6,
                renewal_date = $7,
                is_canceled = $8,
                has_received_initial_allocation = $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(record.user_id)
        .bind(record.subscription_status.as_str())
        .bind(record.subscription_plan.display_name())
        .bind(&record.subscription_id)
        .bind(&record.billing_customer_id)
        .bind(record.requests_remaining)
        .bind(record.renewal_date)
        .bind(record.is_canceled)
        .bind(record.has_received_initial_allocation)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_history(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        history: &NewPaymentHistory,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_history
                (user_id, amount_cents, currency, plan_description, payment_reference, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user_id)
        .bind(history.amount_cents)
        .bind(&history.currency)
        .bind(&history.plan_description)
        .bind(&history.payment_reference)
        .bind(&history.status)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn load(&self, user_id: Uuid) -> BillingResult<Option<EntitlementRecord>> {
        let row: Option<EntitlementRow> = sqlx::query_as(&format!(
            "SELECT {} FROM profiles WHERE id = $1",
            ENTITLEMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(EntitlementRow::into_record))
    }

    async fn load_profile(&self, user_id: Uuid) -> BillingResult<Option<MemberProfile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            r#"
            SELECT
                full_name,
                email,
                stripe_customer_id,
                CASE WHEN referral_commission_queued_at IS NULL
                     THEN NULLIF(TRIM(referral_code_used), '')
                END AS pending_referral_code
            FROM profiles
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| MemberProfile {
            full_name: row.full_name,
            email: row.email,
            billing_customer_id: row.stripe_customer_id,
            pending_referral_code: row.pending_referral_code,
        }))
    }

    async fn link_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<String> {
        let linked: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            UPDATE profiles
            SET stripe_customer_id = COALESCE(stripe_customer_id, $2), updated_at = NOW()
            WHERE id = $1
            RETURNING stripe_customer_id
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        match linked {
            Some((Some(id),)) => Ok(id),
            _ => Err(BillingError::NotFound(format!("member {}", user_id))),
        }
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM profiles WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn commit_activation(&self, activation: &Activation) -> BillingResult<ActivationOutcome> {
        let mut tx = self.pool.begin().await?;

        let current = Self::lock_record(&mut tx, activation.user_id).await?;

        let charge_recorded = match activation.history.payment_reference.as_deref() {
            Some(reference) => {
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM payment_history WHERE user_id = $1 AND payment_reference = $2)",
                )
                .bind(activation.user_id)
                .bind(reference)
                .fetch_one(&mut *tx)
                .await?
            }
            None => false,
        };

        let overwrite_quota = match decide_activation(&current, activation, charge_recorded) {
            ActivationDecision::AlreadyApplied => {
                tx.rollback().await.ok();
                return Ok(ActivationOutcome::AlreadyProcessed);
            }
            ActivationDecision::Apply { overwrite_quota } => overwrite_quota,
        };

        let mut next = current;
        apply_activation(&mut next, activation, overwrite_quota);

        Self::write_record(&mut tx, &next).await?;
        Self::insert_history(&mut tx, activation.user_id, &activation.history).await?;

        tx.commit().await?;

        Ok(ActivationOutcome::Applied {
            quota_overwritten: overwrite_quota,
        })
    }

    async fn commit_renewal(&self, renewal: &Renewal) -> BillingResult<RenewalOutcome> {
        let mut tx = self.pool.begin().await?;

        let mut record = Self::lock_record(&mut tx, renewal.user_id).await?;
        let outcome = if renewal_applies(&record, renewal) {
            apply_renewal(&mut record, renewal);
            Self::write_record(&mut tx, &record).await?;
            RenewalOutcome::Applied
        } else {
            RenewalOutcome::Superseded
        };

        Self::insert_history(&mut tx, renewal.user_id, &renewal.history).await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn deactivate_subscription(&self, subscription_id: &str) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET subscription_status = 'inactive', subscription_id = NULL, updated_at = NOW()
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<EventClaim> {
        // INSERT ... ON CONFLICT ... RETURNING hands the claim to exactly one
        // caller. Failed events and claims stuck in processing can be re-claimed.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $3))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let status: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(EventClaim::Duplicate {
            status: status
                .map(|(status,)| status)
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn finish_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let processing_result = if error.is_some() { "error" } else { "success" };

        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2, processed_at = NOW()
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_history(
        &self,
        user_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentHistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT
                id,
                user_id,
                amount_cents,
                currency,
                plan_description,
                payment_reference,
                status,
                created_at
            FROM payment_history
            WHERE user_id = $1
              AND created_at >= $2
              AND created_at <= $3
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PaymentHistoryEntry::from).collect())
    }

    async fn enqueue_commission(&self, event: &CommissionEvent) -> BillingResult<()> {
        let payload = serde_json::to_value(event)
            .map_err(|e| BillingError::Internal(format!("Failed to encode commission event: {}", e)))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO referral_commission_outbox (id, user_id, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        // The referral is consumed by its first commission
        sqlx::query(
            "UPDATE profiles SET referral_commission_queued_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(event.user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
