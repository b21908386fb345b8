//! Stripe client configuration

use std::collections::HashMap;

use stripe::Client;
use wedmatch_shared::PlanKind;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for the recurring plans
    pub price_ids: PriceIds,
    /// Base URL of the web app (used for provider-side return URLs)
    pub app_base_url: String,
    /// Currency for one-time purchases
    pub currency: String,
}

/// Stripe price IDs for recurring plans
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub monthly: String,
    pub premium: String,
}

/// One-time plan prices in minor units
pub const UNLIMITED_PRICE_CENTS: i64 = 4_999;
pub const UNLIMITED_PROMO_PRICE_CENTS: i64 = 2_999;

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                monthly: std::env::var("STRIPE_PRICE_MONTHLY")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_MONTHLY not set".to_string()))?,
                premium: std::env::var("STRIPE_PRICE_PREMIUM")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_PREMIUM not set".to_string()))?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            currency: std::env::var("STRIPE_CURRENCY").unwrap_or_else(|_| "usd".to_string()),
        })
    }

    /// Get the recurring price ID for a plan
    pub fn price_id_for_plan(&self, plan: PlanKind) -> Option<&str> {
        match plan {
            PlanKind::Monthly => Some(&self.price_ids.monthly),
            PlanKind::Premium => Some(&self.price_ids.premium),
            _ => None,
        }
    }

    /// Get the plan a recurring price ID belongs to
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<PlanKind> {
        if price_id == self.price_ids.monthly {
            Some(PlanKind::Monthly)
        } else if price_id == self.price_ids.premium {
            Some(PlanKind::Premium)
        } else {
            None
        }
    }

    /// Recurring price id to plan, for events that carry no plan metadata
    pub fn price_plans(&self) -> HashMap<String, PlanKind> {
        HashMap::from([
            (self.price_ids.monthly.clone(), PlanKind::Monthly),
            (self.price_ids.premium.clone(), PlanKind::Premium),
        ])
    }

    /// Amount charged for a one-time plan, in minor units
    pub fn one_time_amount(&self, plan: PlanKind) -> Option<i64> {
        match plan {
            PlanKind::Unlimited => Some(UNLIMITED_PRICE_CENTS),
            PlanKind::UnlimitedPromo => Some(UNLIMITED_PROMO_PRICE_CENTS),
            _ => None,
        }
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                monthly: "price_monthly".to_string(),
                premium: "price_premium".to_string(),
            },
            app_base_url: "http://localhost:3000".to_string(),
            currency: "usd".to_string(),
        }
    }

    #[test]
    fn test_price_lookup_round_trips() {
        let config = config();
        assert_eq!(config.price_id_for_plan(PlanKind::Monthly), Some("price_monthly"));
        assert_eq!(config.plan_for_price_id("price_premium"), Some(PlanKind::Premium));
        assert_eq!(config.price_id_for_plan(PlanKind::Unlimited), None);
        assert_eq!(config.plan_for_price_id("price_other"), None);
    }

    #[test]
    fn test_one_time_amounts() {
        let config = config();
        assert_eq!(config.one_time_amount(PlanKind::Unlimited), Some(UNLIMITED_PRICE_CENTS));
        assert_eq!(config.one_time_amount(PlanKind::Monthly), None);
    }
}
