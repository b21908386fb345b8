//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use super::jwt::{JwtError, JwtManager};

/// Member authenticated by a Supabase access token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

impl AuthUser {
    /// Members may only act on their own billing state
    pub fn require_self(&self, user_id: Uuid) -> Result<(), AuthError> {
        if self.user_id == user_id {
            Ok(())
        } else {
            Err(AuthError::SubjectMismatch)
        }
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(String::from)
}

/// Middleware that requires a valid Supabase bearer token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::warn!(path = %path, "require_auth: no bearer token");
        return AuthError::MissingAuth.into_response();
    };

    match authenticate_jwt(&auth_state, &token) {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_supabase_token(token)
        .map_err(|e| match e {
            JwtError::Expired => AuthError::ExpiredToken,
            _ => AuthError::InvalidToken,
        })?;

    let user_id = claims.user_id().map_err(|_| AuthError::InvalidToken)?;
    Ok(AuthUser {
        user_id,
        email: claims.email,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Token has expired")]
    ExpiredToken,
    #[error("Token subject does not match the requested member")]
    SubjectMismatch,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AuthError::MissingAuth => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Authentication required")
            }
            AuthError::InvalidToken => {
                (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", "Invalid or expired token")
            }
            AuthError::ExpiredToken => {
                (StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED", "Token has expired")
            }
            AuthError::SubjectMismatch => {
                (StatusCode::FORBIDDEN, "FORBIDDEN", "Insufficient permissions")
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, middleware, routing::get, Extension, Router};
    use time::Duration;
    use tower::ServiceExt;

    use super::super::jwt::testing::{member_token, token_with, TEST_SECRET};
    use super::super::jwt::SUPABASE_AUDIENCE;
    use super::*;

    async fn whoami(Extension(user): Extension<AuthUser>) -> String {
        user.user_id.to_string()
    }

    fn app() -> Router {
        let auth_state = AuthState {
            jwt_manager: JwtManager::new(TEST_SECRET),
        };
        Router::new()
            .route("/whoami", get(whoami))
            .route_layer(middleware::from_fn_with_state(auth_state, require_auth))
    }

    fn request(authorization: Option<String>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/whoami");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_reaches_handler() {
        let user_id = Uuid::new_v4();
        let response = app()
            .oneshot(request(Some(format!("Bearer {}", member_token(user_id)))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, user_id.to_string().as_bytes());
    }

    #[tokio::test]
    async fn test_missing_and_malformed_headers() {
        let response = app().oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app()
            .oneshot(request(Some("Basic dXNlcjpwYXNz".to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let token = token_with(TEST_SECRET, Uuid::new_v4(), SUPABASE_AUDIENCE, Duration::minutes(-10));
        let response = app()
            .oneshot(request(Some(format!("Bearer {}", token))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_require_self() {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            email: None,
        };
        assert!(user.require_self(user.user_id).is_ok());
        assert!(matches!(
            user.require_self(Uuid::new_v4()),
            Err(AuthError::SubjectMismatch)
        ));
    }
}
