// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Wedmatch Billing Module
//!
//! Turns payments taken through Stripe into member entitlements.
//!
//! ## Features
//!
//! - **Reconciliation**: Apply a confirmed payment intent or subscription to
//!   the member's entitlement exactly once
//! - **Webhooks**: Verify, de-duplicate and route Stripe events
//! - **Checkout**: Create one-time payment intents and incomplete subscriptions
//! - **Customers**: One Stripe customer per member
//! - **History**: Payment history as JSON or CSV
//! - **Commissions**: Referral commission outbox and dispatcher
//! - **Poller**: Client-side confirmation controller with persisted attempts

pub mod card_errors;
pub mod checkout;
pub mod client;
pub mod commission;
pub mod customer;
pub mod error;
pub mod history;
pub mod poller;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod webhooks;


use std::sync::Arc;

use sqlx::PgPool;

// Card errors
pub use card_errors::{card_error_message, requires_new_payment_method};

// Checkout
pub use checkout::{ChargeSession, CheckoutService};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Commission
pub use commission::{CommissionConfig, CommissionDispatcher, CommissionEvent};

// Customer
pub use customer::CustomerService;

// Error
pub use error::{BillingError, BillingResult};

// History
pub use history::{HistorySummary, PaymentHistoryService};

// Poller
pub use poller::{
    PaymentAttempt, PaymentPoller, PlanSelection, PollerConfig, PollerState, SubmittedCharge,
};

// Provider
pub use provider::{BillingProvider, InMemoryBillingProvider, StripeBillingProvider};

// Reconcile
pub use reconcile::{
    ChargeReference, ReconcileOutcome, ReconcileRequest, ReconcileResponse, ReconciliationEngine,
};

// Store
pub use store::{
    EntitlementRecord, EntitlementStore, InMemoryEntitlementStore, PaymentHistoryEntry,
    PgEntitlementStore, RenewalOutcome,
};

// Webhooks
pub use webhooks::{WebhookAck, WebhookIngestor};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub engine: ReconciliationEngine,
    pub webhooks: WebhookIngestor,
    pub checkout: CheckoutService,
    pub history: PaymentHistoryService,
    pub customer: CustomerService,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let store: Arc<dyn EntitlementStore> = Arc::new(PgEntitlementStore::new(pool));
        let provider: Arc<dyn BillingProvider> =
            Arc::new(StripeBillingProvider::new(StripeClient::new(config.clone())));
        Self::with_parts(config, store, provider)
    }

    /// Assemble the service over any store and provider
    pub fn with_parts(
        config: StripeConfig,
        store: Arc<dyn EntitlementStore>,
        provider: Arc<dyn BillingProvider>,
    ) -> Self {
        let engine = ReconciliationEngine::new(store.clone(), provider.clone())
            .with_price_plans(config.price_plans());
        let customer = engine.customers().clone();

        Self {
            webhooks: WebhookIngestor::new(engine.clone(), config.webhook_secret.clone()),
            checkout: CheckoutService::new(provider, customer.clone(), config),
            history: PaymentHistoryService::new(store),
            customer,
            engine,
        }
    }
}
