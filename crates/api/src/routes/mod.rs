//! API routes

pub mod billing;
pub mod health;

#[cfg(test)]
mod router_tests;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let mut public_api_routes = Router::new();
    let mut protected_api_routes = Router::new();

    // Billing routes are only mounted when the service is configured
    if state.billing.is_some() {
        // Stripe webhook (public, uses signature verification)
        public_api_routes = public_api_routes.route("/billing/webhook", post(billing::webhook));

        protected_api_routes = protected_api_routes
            .route("/billing/reconcile", post(billing::reconcile))
            .route("/billing/payment-intents", post(billing::create_payment_intent))
            .route("/billing/subscriptions", post(billing::create_subscription))
            .route("/billing/history", get(billing::get_history))
            .route("/billing/history/export", get(billing::export_history));
    }

    // Apply auth middleware to protected routes
    let protected_api_routes = protected_api_routes
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    // Combine API routes under /api/v1 prefix
    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(protected_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
