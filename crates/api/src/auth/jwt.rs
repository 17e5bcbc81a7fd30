//! Bearer token validation (HS256)

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::AuthError;

/// Claims carried by an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    /// Organization the token was issued for; nil for platform operators
    pub org_id: Uuid,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            expiry_hours,
        }
    }

    /// Issue a token for a user acting within an organization
    pub fn generate_token(&self, user_id: Uuid, org_id: Uuid) -> Result<String, AuthError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: user_id,
            org_id,
            iat: now,
            exp: now + self.expiry_hours * 3600,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token validation failed");
                AuthError::InvalidToken
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::TEST_SECRET;

    #[test]
    fn test_token_round_trip() {
        let manager = JwtManager::new(TEST_SECRET, 24);
        let user_id = Uuid::new_v4();
        let org_id = Uuid::new_v4();

        let token = manager.generate_token(user_id, org_id).unwrap();
        let claims = manager.validate_token(&token).unwrap();

        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.org_id, org_id);
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtManager::new(TEST_SECRET, 24);
        let other = JwtManager::new("another-secret-that-is-also-32-bytes-long", 24);

        let token = issuer.generate_token(Uuid::new_v4(), Uuid::new_v4()).unwrap();
        assert!(matches!(
            other.validate_token(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Well past the default 60s leeway
        let manager = JwtManager::new(TEST_SECRET, -2);
        let token = manager.generate_token(Uuid::new_v4(), Uuid::new_v4()).unwrap();
        assert!(matches!(
            manager.validate_token(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let manager = JwtManager::new(TEST_SECRET, 24);
        assert!(manager.validate_token("not.a.token").is_err());
    }
}
