//! Referral commission outbox processor
//!
//! Drains `referral_commission_outbox` with bounded attempts. Rows are leased
//! with `FOR UPDATE SKIP LOCKED` so overlapping runs never deliver the same
//! event twice at once; the affiliate service de-duplicates on event id for
//! the rest.

use serde_json::Value;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;
use wedmatch_billing::{BillingError, CommissionDispatcher, CommissionEvent};

/// Rows taken per run
const BATCH_SIZE: i64 = 20;

/// How long a leased row stays invisible to other runs
const LEASE_SECONDS: i64 = 300;

/// Backoff before the next attempt, doubling from one minute up to an hour
pub fn retry_delay_seconds(attempts: i32) -> i64 {
    let exponent = attempts.clamp(1, 7) as u32 - 1;
    (60_i64 << exponent).min(3600)
}

/// What to do with a row after a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Try again after the delay
    Retry { delay_seconds: i64 },
    /// Give up; the row stays for inspection
    GiveUp,
}

pub fn failure_action(attempts: i32, max_attempts: i32, error: &BillingError) -> FailureAction {
    if !error.is_transient() || attempts >= max_attempts {
        FailureAction::GiveUp
    } else {
        FailureAction::Retry {
            delay_seconds: retry_delay_seconds(attempts),
        }
    }
}

/// Lease due rows and bump their attempt counter in one statement
async fn lease_due_commissions(pool: &PgPool) -> Result<Vec<(Uuid, Value, i32, i32)>, sqlx::Error> {
    sqlx::query_as(
        r#"
        UPDATE referral_commission_outbox
        SET attempts = attempts + 1,
            next_attempt_at = NOW() + make_interval(secs => $2)
        WHERE id IN (
            SELECT id
            FROM referral_commission_outbox
            WHERE status = 'pending'
              AND next_attempt_at <= NOW()
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, payload, attempts, max_attempts
        "#,
    )
    .bind(BATCH_SIZE)
    .bind(LEASE_SECONDS as f64)
    .fetch_all(pool)
    .await
}

/// Deliver due commission events
pub async fn process_commission_outbox(pool: &PgPool, dispatcher: &CommissionDispatcher) {
    let rows = match lease_due_commissions(pool).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to lease commission events from outbox");
            return;
        }
    };

    if rows.is_empty() {
        return;
    }

    info!(count = rows.len(), "Processing referral commission events");

    for (outbox_id, payload, attempts, max_attempts) in rows {
        let result = match serde_json::from_value::<CommissionEvent>(payload) {
            Ok(event) => dispatcher.dispatch(&event).await,
            Err(e) => Err(BillingError::Internal(format!(
                "Undecodable commission payload: {}",
                e
            ))),
        };

        match result {
            Ok(()) => mark_delivered(pool, outbox_id).await,
            Err(e) => mark_failed(pool, outbox_id, attempts, max_attempts, &e).await,
        }
    }
}

async fn mark_delivered(pool: &PgPool, outbox_id: Uuid) {
    if let Err(e) = sqlx::query(
        r#"
        UPDATE referral_commission_outbox
        SET status = 'delivered', delivered_at = NOW(), last_error = NULL
        WHERE id = $1
        "#,
    )
    .bind(outbox_id)
    .execute(pool)
    .await
    {
        // The lease expires and the event is sent again; the receiver de-duplicates
        error!(outbox_id = %outbox_id, error = %e, "Failed to mark commission as delivered");
        return;
    }
    info!(outbox_id = %outbox_id, "Commission event delivered");
}

async fn mark_failed(
    pool: &PgPool,
    outbox_id: Uuid,
    attempts: i32,
    max_attempts: i32,
    err: &BillingError,
) {
    let error_msg = err.to_string();
    let action = failure_action(attempts, max_attempts, err);

    let result = match action {
        FailureAction::Retry { delay_seconds } => {
            sqlx::query(
                r#"
                UPDATE referral_commission_outbox
                SET last_error = $2,
                    next_attempt_at = NOW() + make_interval(secs => $3)
                WHERE id = $1
                "#,
            )
            .bind(outbox_id)
            .bind(&error_msg)
            .bind(delay_seconds as f64)
            .execute(pool)
            .await
        }
        FailureAction::GiveUp => {
            sqlx::query(
                "UPDATE referral_commission_outbox SET status = 'failed', last_error = $2 WHERE id = $1",
            )
            .bind(outbox_id)
            .bind(&error_msg)
            .execute(pool)
            .await
        }
    };

    if let Err(e) = result {
        error!(outbox_id = %outbox_id, error = %e, "Failed to record commission failure");
    }

    match action {
        FailureAction::Retry { delay_seconds } => warn!(
            outbox_id = %outbox_id,
            attempts = attempts,
            max_attempts = max_attempts,
            retry_in_seconds = delay_seconds,
            error = %error_msg,
            "Commission delivery failed, will retry"
        ),
        FailureAction::GiveUp => error!(
            outbox_id = %outbox_id,
            attempts = attempts,
            error = %error_msg,
            "Commission delivery permanently failed"
        ),
    }
}

/// Prune finished webhook event rows and delivered commissions
pub async fn cleanup_processed_events(pool: &PgPool, retention_days: i32) {
    let events = sqlx::query(
        r#"
        DELETE FROM stripe_webhook_events
        WHERE created_at < NOW() - make_interval(days => $1)
          AND processing_result IN ('success', 'error')
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match events {
        Ok(rows) if rows.rows_affected() > 0 => info!(
            deleted = rows.rows_affected(),
            retention_days = retention_days,
            "Cleaned up old Stripe webhook events"
        ),
        Ok(_) => {}
        Err(e) => error!(error = %e, "Failed to cleanup Stripe webhook events"),
    }

    let commissions = sqlx::query(
        r#"
        DELETE FROM referral_commission_outbox
        WHERE status = 'delivered'
          AND delivered_at < NOW() - make_interval(days => $1)
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match commissions {
        Ok(rows) if rows.rows_affected() > 0 => info!(
            deleted = rows.rows_affected(),
            "Cleaned up delivered commission events"
        ),
        Ok(_) => {}
        Err(e) => error!(error = %e, "Failed to cleanup commission outbox"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay_seconds(0), 60);
        assert_eq!(retry_delay_seconds(1), 60);
        assert_eq!(retry_delay_seconds(2), 120);
        assert_eq!(retry_delay_seconds(3), 240);
        assert_eq!(retry_delay_seconds(6), 1920);
        assert_eq!(retry_delay_seconds(7), 3600);
        assert_eq!(retry_delay_seconds(50), 3600);
    }

    #[test]
    fn test_transient_failure_retries_until_max() {
        let err = BillingError::Http("affiliate service returned 503".to_string());
        assert_eq!(
            failure_action(1, 5, &err),
            FailureAction::Retry { delay_seconds: 60 }
        );
        assert_eq!(failure_action(5, 5, &err), FailureAction::GiveUp);
    }

    #[test]
    fn test_permanent_failure_gives_up_immediately() {
        let err = BillingError::InvalidInput("unknown referral code".to_string());
        assert_eq!(failure_action(1, 5, &err), FailureAction::GiveUp);

        let undecodable = BillingError::Internal("Undecodable commission payload".to_string());
        assert_eq!(failure_action(1, 5, &undecodable), FailureAction::GiveUp);
    }
}
