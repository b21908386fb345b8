//! Persisted in-flight payment attempt
//!
//! The attempt survives navigation and restarts so a resumed controller
//! reconciles the charge it already started instead of submitting a new one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::reconcile::ReconcileRequest;

/// Fixed key the attempt is stored under
pub const ATTEMPT_STORAGE_KEY: &str = "wedmatch.pendingPayment";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAttempt {
    pub in_progress: bool,
    pub is_subscription: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_id: Option<String>,
    pub plan_name: String,
    #[serde(default)]
    pub plan_price: String,
}

impl PaymentAttempt {
    /// Build the reconcile call for this attempt
    pub fn to_request(&self, user_id: Uuid) -> ReconcileRequest {
        ReconcileRequest {
            payment_intent_id: self.payment_intent_id.clone(),
            subscription_id: self.subscription_id.clone(),
            user_id,
            plan_name: self.plan_name.clone(),
            plan_price: self.plan_price.clone(),
            requests_override: None,
        }
    }

    /// Whether there is a provider reference to reconcile against
    pub fn has_reference(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.payment_intent_id) || present(&self.subscription_id)
    }
}

/// Load/save/clear access to the single persisted attempt
#[async_trait]
pub trait AttemptStorage: Send + Sync {
    async fn load(&self) -> BillingResult<Option<PaymentAttempt>>;

    async fn save(&self, attempt: &PaymentAttempt) -> BillingResult<()>;

    async fn clear(&self) -> BillingResult<()>;
}

// =============================================================================
// File storage
// =============================================================================

/// Stores the attempt as a JSON document in a local directory
#[derive(Debug, Clone)]
pub struct FileAttemptStorage {
    path: PathBuf,
}

impl FileAttemptStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.json", ATTEMPT_STORAGE_KEY)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> BillingError {
    BillingError::Internal(format!("Failed to {} {}: {}", action, path.display(), err))
}

#[async_trait]
impl AttemptStorage for FileAttemptStorage {
    async fn load(&self) -> BillingResult<Option<PaymentAttempt>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &self.path, e)),
        };

        match serde_json::from_slice::<PaymentAttempt>(&raw) {
            Ok(attempt) => Ok(Some(attempt)),
            Err(e) => {
                // A corrupt blob cannot be resumed; treat it as absent
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Discarding unreadable payment attempt"
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, attempt: &PaymentAttempt) -> BillingResult<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error("create", dir, e))?;
        }

        let body = serde_json::to_vec(attempt)
            .map_err(|e| BillingError::Internal(format!("Failed to encode attempt: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| io_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error("replace", &self.path, e))?;
        Ok(())
    }

    async fn clear(&self) -> BillingResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &self.path, e)),
        }
    }
}

// =============================================================================
// In-memory storage
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryAttemptStorage {
    slot: Mutex<Option<PaymentAttempt>>,
}

impl MemoryAttemptStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempt(attempt: PaymentAttempt) -> Self {
        Self {
            slot: Mutex::new(Some(attempt)),
        }
    }
}

#[async_trait]
impl AttemptStorage for MemoryAttemptStorage {
    async fn load(&self) -> BillingResult<Option<PaymentAttempt>> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, attempt: &PaymentAttempt) -> BillingResult<()> {
        *self.slot.lock().await = Some(attempt.clone());
        Ok(())
    }

    async fn clear(&self) -> BillingResult<()> {
        *self.slot.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PaymentAttempt {
        PaymentAttempt {
            in_progress: true,
            is_subscription: true,
            payment_intent_id: Some("pi_1".to_string()),
            subscription_id: Some("sub_1".to_string()),
            customer_id: Some("cus_1".to_string()),
            price_id: Some("price_monthly".to_string()),
            plan_name: "Monthly Plan".to_string(),
            plan_price: "$9.99/month".to_string(),
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("wedmatch-attempt-{}", Uuid::new_v4()))
    }

    #[test]
    fn test_attempt_json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["inProgress"], true);
        assert_eq!(json["isSubscription"], true);
        assert_eq!(json["subscriptionId"], "sub_1");
        assert_eq!(json["planPrice"], "$9.99/month");
    }

    #[test]
    fn test_to_request_carries_references() {
        let user_id = Uuid::new_v4();
        let request = sample().to_request(user_id);
        assert_eq!(request.user_id, user_id);
        assert_eq!(request.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(request.plan_name, "Monthly Plan");
        assert!(request.requests_override.is_none());
    }

    #[test]
    fn test_has_reference() {
        let mut attempt = sample();
        assert!(attempt.has_reference());
        attempt.payment_intent_id = None;
        attempt.subscription_id = Some("  ".to_string());
        assert!(!attempt.has_reference());
    }

    #[tokio::test]
    async fn test_file_storage_save_load_clear() {
        let dir = scratch_dir();
        let storage = FileAttemptStorage::new(&dir);

        assert!(storage.load().await.unwrap().is_none());

        storage.save(&sample()).await.unwrap();
        assert_eq!(storage.load().await.unwrap(), Some(sample()));
        assert!(storage.path().ends_with("wedmatch.pendingPayment.json"));

        storage.clear().await.unwrap();
        assert!(storage.load().await.unwrap().is_none());
        // Clearing twice is fine
        storage.clear().await.unwrap();

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_file_storage_ignores_corrupt_blob() {
        let dir = scratch_dir();
        let storage = FileAttemptStorage::new(&dir);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(storage.path(), b"{not json").await.unwrap();

        assert!(storage.load().await.unwrap().is_none());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
