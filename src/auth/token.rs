use super::error::AuthError;
use super::state_store::keys;
use super::traits::{AccessClaims, AccessToken, StateStore, TokenIssuer, TokenValidator};
use super::users::User;
use anyhow::{Result, anyhow};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use std::sync::Arc;
use uuid::Uuid;

const ISSUER: &str = "gitcode-auth";

/// 64 random bytes, hex encoded. Used for refresh tokens and oauth state.
pub fn generate_opaque_token(len_bytes: usize) -> String {
    let mut bytes = vec![0u8; len_bytes];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct JwtTokenIssuer {
    encoding_key: EncodingKey,
    expiration: std::time::Duration,
}

impl JwtTokenIssuer {
    pub fn new(secret: &str, expiration: std::time::Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            expiration,
        }
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue_access_token(&self, user: &User) -> Result<AccessToken> {
        let now = Utc::now();
        let ttl = Duration::from_std(self.expiration)
            .map_err(|_| anyhow!("access token expiration out of range"))?;

        let claims = AccessClaims {
            sub: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            roles: user.roles.clone(),
            permissions: user.permissions.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
            iss: ISSUER.to_string(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| anyhow!("Failed to encode JWT: {}", e))?;

        Ok(AccessToken {
            access_token: token,
            token_type: "Bearer".to_string(),
            expires_in: self.expiration.as_secs(),
        })
    }
}

pub struct JwtTokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtTokenValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["sub", "exp", "iat", "iss"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenValidator for JwtTokenValidator {
    fn validate_token(&self, token: &str) -> Result<AccessClaims> {
        let token_data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| anyhow!("Invalid JWT: {}", e))?;

        Ok(token_data.claims)
    }
}

/// Opaque refresh tokens: `refresh_token:{token}` -> user id, with a TTL
#[derive(Clone)]
pub struct RefreshTokens {
    store: Arc<dyn StateStore + Send + Sync>,
    ttl: std::time::Duration,
}

impl RefreshTokens {
    pub fn new(store: Arc<dyn StateStore + Send + Sync>, ttl: std::time::Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> std::time::Duration {
        self.ttl
    }

    pub async fn issue(&self, user_id: &str) -> Result<String> {
        let token = generate_opaque_token(64);
        self.store
            .set(&keys::refresh_token(&token), user_id, self.ttl)
            .await?;
        Ok(token)
    }

    /// Consumes the token and returns the user it was bound to. A token can be
    /// redeemed exactly once; a second call (or a concurrent one) gets
    /// `InvalidRefreshToken`.
    pub async fn redeem(&self, token: &str) -> Result<String, AuthError> {
        self.store
            .take(&keys::refresh_token(token))
            .await?
            .ok_or(AuthError::InvalidRefreshToken)
    }

    pub async fn revoke(&self, token: &str) -> Result<()> {
        self.store.del(&keys::refresh_token(token)).await
    }
}

/// `blacklist:user:{id}` entries; presence alone invalidates the user
#[derive(Clone)]
pub struct Blacklist {
    store: Arc<dyn StateStore + Send + Sync>,
    ttl: std::time::Duration,
}

impl Blacklist {
    /// `ttl` must be at least the refresh token TTL or a banned user could
    /// outlive their ban with a token issued just before it
    pub fn new(store: Arc<dyn StateStore + Send + Sync>, ttl: std::time::Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn add(&self, user_id: &str) -> Result<()> {
        self.store
            .set(
                &keys::blacklisted_user(user_id),
                &Utc::now().to_rfc3339(),
                self.ttl,
            )
            .await
    }

    pub async fn remove(&self, user_id: &str) -> Result<()> {
        self.store.del(&keys::blacklisted_user(user_id)).await
    }

    pub async fn contains(&self, user_id: &str) -> Result<bool> {
        self.store.exists(&keys::blacklisted_user(user_id)).await
    }
}
