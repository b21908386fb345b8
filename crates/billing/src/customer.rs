//! Provider customer management
//!
//! Every member has at most one provider customer. It is created lazily on the
//! first payment attempt, linked to the member's row and reused afterwards.
//! The customer's description carries a `Wedmatch user: <uuid>` marker so
//! webhook events can be traced back to a member even when the provider drops
//! our metadata.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, CustomerUpdate, NewCustomer, METADATA_USER_ID};
use crate::store::{EntitlementStore, MemberProfile};

/// Label in front of the member id in a customer's description
pub const CUSTOMER_MARKER_LABEL: &str = "Wedmatch user";

/// Description written on provider customers
pub fn customer_marker(user_id: Uuid) -> String {
    format!("{}: {}", CUSTOMER_MARKER_LABEL, user_id)
}

/// Extract the member id from a customer description
pub fn user_id_from_marker(description: &str) -> Option<Uuid> {
    let start = description.find(CUSTOMER_MARKER_LABEL)?;
    let rest = description[start + CUSTOMER_MARKER_LABEL.len()..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let candidate: String = rest
        .chars()
        .take_while(|c| c.is_ascii_hexdigit() || *c == '-')
        .collect();
    Uuid::parse_str(&candidate).ok()
}

/// Customer service for managing provider customers
#[derive(Clone)]
pub struct CustomerService {
    store: Arc<dyn EntitlementStore>,
    provider: Arc<dyn BillingProvider>,
}

impl CustomerService {
    pub fn new(store: Arc<dyn EntitlementStore>, provider: Arc<dyn BillingProvider>) -> Self {
        Self { store, provider }
    }

    async fn profile(&self, user_id: Uuid) -> BillingResult<MemberProfile> {
        self.store
            .load_profile(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("member {}", user_id)))
    }

    /// Create or get the provider customer for a member
    pub async fn get_or_create_customer(&self, user_id: Uuid) -> BillingResult<String> {
        self.ensure_customer(user_id, None).await
    }

    /// Resolve the member's customer, linking `charge_customer` (the customer
    /// a confirmed charge was made under) when the member has none yet.
    ///
    /// An existing link always wins. The customer's display fields are
    /// refreshed from the profile on every call.
    pub async fn ensure_customer(
        &self,
        user_id: Uuid,
        charge_customer: Option<&str>,
    ) -> BillingResult<String> {
        let profile = self.profile(user_id).await?;

        if let Some(existing) = profile.billing_customer_id.as_deref() {
            if let Some(charged) = charge_customer {
                if charged != existing {
                    tracing::warn!(
                        user_id = %user_id,
                        linked_customer = %existing,
                        charge_customer = %charged,
                        "Charge was made under a different customer than the linked one"
                    );
                }
            }
            self.sync_customer(existing, user_id, &profile).await;
            return Ok(existing.to_string());
        }

        let (candidate, created) = match charge_customer {
            Some(id) => (id.to_string(), false),
            None => (self.create_customer(user_id, &profile).await?, true),
        };

        let linked = self.store.link_customer(user_id, &candidate).await?;
        if linked != candidate {
            // Lost a race with a concurrent request that linked first
            tracing::warn!(
                user_id = %user_id,
                linked_customer = %linked,
                unused_customer = %candidate,
                "Member was linked to another customer concurrently"
            );
        } else {
            tracing::info!(user_id = %user_id, customer_id = %linked, "Linked billing customer");
        }

        if !created || linked != candidate {
            self.sync_customer(&linked, user_id, &profile).await;
        }

        Ok(linked)
    }

    async fn create_customer(&self, user_id: Uuid, profile: &MemberProfile) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_USER_ID.to_string(), user_id.to_string());
        metadata.insert("platform".to_string(), "wedmatch".to_string());

        let customer = self
            .provider
            .create_customer(NewCustomer {
                email: profile.email.clone(),
                name: profile.full_name.clone(),
                description: Some(customer_marker(user_id)),
                metadata,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created billing customer"
        );

        Ok(customer.id)
    }

    /// Refresh the customer's name, email and member marker. Cosmetic, so
    /// failures are logged and swallowed.
    async fn sync_customer(&self, customer_id: &str, user_id: Uuid, profile: &MemberProfile) {
        let update = CustomerUpdate {
            email: profile.email.clone(),
            name: profile.full_name.clone(),
            description: Some(customer_marker(user_id)),
        };

        if let Err(e) = self.provider.update_customer(customer_id, update).await {
            tracing::warn!(
                user_id = %user_id,
                customer_id = %customer_id,
                error = %e,
                "Failed to refresh billing customer details"
            );
        }
    }

    /// Find the member behind a provider customer: the description marker
    /// first, then the stored link
    pub async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        match self.provider.retrieve_customer(customer_id).await {
            Ok(customer) => {
                if let Some(user_id) = customer.description.as_deref().and_then(user_id_from_marker) {
                    return Ok(Some(user_id));
                }
            }
            Err(BillingError::CustomerNotFound(_)) => {}
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to retrieve customer while resolving member, falling back to stored link"
                );
            }
        }

        self.store.find_user_by_customer(customer_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_round_trip() {
        let user_id = Uuid::new_v4();
        assert_eq!(user_id_from_marker(&customer_marker(user_id)), Some(user_id));
    }

    #[test]
    fn test_marker_inside_longer_description() {
        let user_id = Uuid::new_v4();
        let description = format!("VIP member. Wedmatch user:{} (migrated)", user_id);
        assert_eq!(user_id_from_marker(&description), Some(user_id));
    }

    #[test]
    fn test_marker_rejects_garbage() {
        assert_eq!(user_id_from_marker("Wedmatch user: not-a-uuid"), None);
        assert_eq!(user_id_from_marker("Some other customer"), None);
        assert_eq!(user_id_from_marker(""), None);
    }
}
