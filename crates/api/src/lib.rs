#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Wedmatch API Library
//!
//! HTTP surface of the payment pipeline: the Stripe webhook, reconciliation,
//! charge creation and payment history, behind Supabase authentication.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
