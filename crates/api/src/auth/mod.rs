//! Authentication module for Wedmatch

pub mod jwt;
pub mod middleware;

pub use jwt::{JwtError, JwtManager, SupabaseClaims};
pub use middleware::{require_auth, AuthError, AuthState, AuthUser};
