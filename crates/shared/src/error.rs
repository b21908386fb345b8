//! Error types for Wedmatch

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    #[error("Unknown subscription status: {0}")]
    UnknownStatus(String),
}
