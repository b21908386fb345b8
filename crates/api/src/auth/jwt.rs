//! Supabase access token validation

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audience Supabase puts on tokens for signed-in members
pub const SUPABASE_AUDIENCE: &str = "authenticated";

/// JWT claims structure for Supabase-issued tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseClaims {
    /// Subject (user ID as string, will be parsed to UUID)
    pub sub: String,
    pub email: Option<String>,
    /// Role (authenticated, anon, etc.)
    pub role: Option<String>,
    pub aud: Option<String>,
    pub iat: Option<i64>,
    pub exp: i64,
}

impl SupabaseClaims {
    pub fn user_id(&self) -> Result<Uuid, JwtError> {
        Uuid::parse_str(&self.sub).map_err(|_| JwtError::Invalid)
    }
}

/// Validates bearer tokens issued by Supabase Auth
#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(supabase_secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(supabase_secret.as_bytes()),
        }
    }

    /// Validate a Supabase-issued JWT token.
    ///
    /// Only HS256 is accepted, and the audience must be `authenticated`.
    pub fn validate_supabase_token(&self, token: &str) -> Result<SupabaseClaims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance
        validation.set_audience(&[SUPABASE_AUDIENCE]);

        match decode::<SupabaseClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(JwtError::Expired),
                jsonwebtoken::errors::ErrorKind::InvalidToken => Err(JwtError::Invalid),
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => Err(JwtError::Invalid),
                jsonwebtoken::errors::ErrorKind::InvalidSignature => Err(JwtError::Invalid),
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    tracing::warn!("Supabase JWT audience validation failed - rejecting token");
                    Err(JwtError::Invalid)
                }
                _ => Err(JwtError::Validation(e.to_string())),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token validation failed: {0}")]
    Validation(String),
}


#[cfg(test)]
mod tests {
    use time::Duration;

    use super::testing::*;
    use super::*;

    #[test]
    fn test_valid_supabase_token() {
        let jwt = JwtManager::new(TEST_SECRET);
        let user_id = Uuid::new_v4();

        let claims = jwt.validate_supabase_token(&member_token(user_id)).unwrap();
        assert_eq!(claims.user_id().unwrap(), user_id);
        assert_eq!(claims.aud.as_deref(), Some(SUPABASE_AUDIENCE));
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let jwt = JwtManager::new(TEST_SECRET);
        let token = token_with(TEST_SECRET, Uuid::new_v4(), "anon", Duration::hours(1));
        assert!(matches!(jwt.validate_supabase_token(&token), Err(JwtError::Invalid)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtManager::new(TEST_SECRET);
        // Beyond the 60s leeway
        let token = token_with(TEST_SECRET, Uuid::new_v4(), SUPABASE_AUDIENCE, Duration::minutes(-5));
        assert!(matches!(jwt.validate_supabase_token(&token), Err(JwtError::Expired)));
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let jwt = JwtManager::new(TEST_SECRET);
        let token = token_with(
            "some-other-project-secret-32-characters!",
            Uuid::new_v4(),
            SUPABASE_AUDIENCE,
            Duration::hours(1),
        );
        assert!(matches!(jwt.validate_supabase_token(&token), Err(JwtError::Invalid)));
    }

    #[test]
    fn test_non_uuid_subject() {
        let claims = SupabaseClaims {
            sub: "service-role".to_string(),
            email: None,
            role: None,
            aud: None,
            iat: None,
            exp: 0,
        };
        assert!(claims.user_id().is_err());
    }
}
