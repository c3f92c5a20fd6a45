use super::permissions::{Permission, Role};
use super::users::{ProviderTokenRecord, User, UserStatus, UserUpsert};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Short-lived key/value store with per-key TTL (redis in prod, a hashmap in dev)
#[async_trait]
pub trait StateStore {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Read and delete in one step, so only one caller ever sees the value
    async fn take(&self, key: &str) -> Result<Option<String>>;
}

/// Whatever owns the users table
#[async_trait]
pub trait UserRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<User>>;
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>>;
    /// Create-or-update keyed on the IdP subject
    async fn upsert_user(&self, upsert: UserUpsert) -> Result<User>;
    async fn set_status(&self, id: &str, status: UserStatus) -> Result<Option<User>>;
    async fn upsert_provider_token(&self, token: ProviderTokenRecord) -> Result<()>;
    async fn find_provider_token(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<ProviderTokenRecord>>;
}

pub trait TokenIssuer {
    fn issue_access_token(&self, user: &User) -> Result<AccessToken>;
}

pub trait TokenValidator {
    fn validate_token(&self, token: &str) -> Result<AccessClaims>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64, // seconds
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String, // internal user id
    pub username: String,
    pub email: String,
    pub roles: BTreeSet<Role>,
    pub permissions: BTreeSet<Permission>,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub iss: String,
}
