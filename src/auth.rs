//! Session-token verification
//!
//! Tokens are minted by the auth gateway; this service only verifies the
//! HS256 signature and expiry, then trusts the embedded user id.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::AppError, AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub exp: i64,
}

pub fn validate_token(token: &str, secret: &str) -> Result<Uuid, AppError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::Unauthorized("invalid token".to_string()))?;

    Ok(data.claims.user_id)
}

/// Authenticated user context extracted from the Authorization header
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("missing authorization header".to_string()))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Unauthorized("invalid authorization header".to_string()))?;

        let user_id = validate_token(token, &state.config.auth.jwt_secret)?;

        Ok(AuthUser { user_id })
    }
}

#[cfg(test)]
pub fn issue_token(user_id: Uuid, secret: &str, ttl_secs: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        user_id,
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encoding")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let user = Uuid::new_v4();
        let token = issue_token(user, "secret", 60);
        assert_eq!(validate_token(&token, "secret").unwrap(), user);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token(Uuid::new_v4(), "secret", 60);
        assert!(validate_token(&token, "other").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = issue_token(Uuid::new_v4(), "secret", -120);
        assert!(validate_token(&token, "secret").is_err());
    }
}
