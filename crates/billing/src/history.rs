//! Payment history
//!
//! Lists a member's recorded charges and exports them to CSV for billing
//! statements and support requests.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{EntitlementStore, PaymentHistoryEntry};

/// Default lookback when no start date is given
const DEFAULT_LOOKBACK_DAYS: i64 = 365;

/// Service for reading payment history
#[derive(Clone)]
pub struct PaymentHistoryService {
    store: Arc<dyn EntitlementStore>,
}

impl PaymentHistoryService {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Get history entries for a member, newest first
    pub async fn get_history(
        &self,
        user_id: Uuid,
        start_date: Option<OffsetDateTime>,
        end_date: Option<OffsetDateTime>,
    ) -> BillingResult<Vec<PaymentHistoryEntry>> {
        let end = end_date.unwrap_or_else(OffsetDateTime::now_utc);
        let start = start_date.unwrap_or_else(|| end - time::Duration::days(DEFAULT_LOOKBACK_DAYS));
        self.store.list_history(user_id, start, end).await
    }

    /// Export a member's history to CSV format
    pub async fn export_history_csv(
        &self,
        user_id: Uuid,
        start_date: Option<OffsetDateTime>,
        end_date: Option<OffsetDateTime>,
    ) -> BillingResult<String> {
        let entries = self.get_history(user_id, start_date, end_date).await?;
        Ok(render_csv(&entries))
    }

    /// Totals for a member's history
    pub async fn get_summary(
        &self,
        user_id: Uuid,
        start_date: Option<OffsetDateTime>,
        end_date: Option<OffsetDateTime>,
    ) -> BillingResult<HistorySummary> {
        let entries = self.get_history(user_id, start_date, end_date).await?;
        Ok(HistorySummary::from_entries(user_id, &entries))
    }
}

/// Summary of a member's charges
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistorySummary {
    pub user_id: Uuid,
    pub total_paid_cents: i64,
    pub payment_count: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_at: Option<OffsetDateTime>,
}

impl HistorySummary {
    pub fn from_entries(user_id: Uuid, entries: &[PaymentHistoryEntry]) -> Self {
        let succeeded = entries.iter().filter(|entry| entry.status == "succeeded");
        Self {
            user_id,
            total_paid_cents: succeeded.clone().map(|entry| entry.amount_cents).sum(),
            payment_count: succeeded.clone().count(),
            last_payment_at: succeeded.map(|entry| entry.created_at).max(),
        }
    }
}

/// Render history entries as CSV
pub fn render_csv(entries: &[PaymentHistoryEntry]) -> String {
    let mut csv = String::new();

    csv.push_str("Date,Description,Amount,Currency,Status,Reference\n");

    for entry in entries {
        let amount = entry.amount_cents as f64 / 100.0;
        let date = entry
            .created_at
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());

        let description = escape_csv_field(&entry.plan_description);
        let reference = escape_csv_field(entry.payment_reference.as_deref().unwrap_or_default());

        csv.push_str(&format!(
            "{},{},{:.2},{},{},{}\n",
            date,
            description,
            amount,
            entry.currency.to_uppercase(),
            escape_csv_field(&entry.status),
            reference
        ));
    }

    csv
}

/// Escape a field for CSV output
fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(description: &str, amount_cents: i64, status: &str) -> PaymentHistoryEntry {
        PaymentHistoryEntry {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            amount_cents,
            currency: "usd".to_string(),
            plan_description: description.to_string(),
            payment_reference: Some("pi_1".to_string()),
            status: status.to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_escape_csv_field() {
        assert_eq!(escape_csv_field("plain"), "plain");
        assert_eq!(escape_csv_field("a,b"), "\"a,b\"");
        assert_eq!(escape_csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_render_csv() {
        let csv = render_csv(&[entry("Monthly Plan ($9.99, billed monthly)", 999, "succeeded")]);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("Date,Description,Amount,Currency,Status,Reference"));
        assert_eq!(
            lines.next(),
            Some("1970-01-01T00:00:00Z,\"Monthly Plan ($9.99, billed monthly)\",9.99,USD,succeeded,pi_1")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_summary_counts_only_succeeded() {
        let entries = vec![
            entry("Monthly Plan", 999, "succeeded"),
            entry("Monthly Plan renewal", 999, "succeeded"),
            entry("Premium Plan", 1499, "failed"),
        ];
        let summary = HistorySummary::from_entries(Uuid::nil(), &entries);
        assert_eq!(summary.total_paid_cents, 1998);
        assert_eq!(summary.payment_count, 2);
        assert_eq!(summary.last_payment_at, Some(OffsetDateTime::UNIX_EPOCH));
    }
}
