use super::permissions::{Permission, Role};
use super::traits::UserRepository;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Active,
    Banned,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    /// keycloak `sub`
    pub external_id: String,
    pub email: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub email_verified: bool,
    pub status: UserStatus,
    pub roles: BTreeSet<Role>,
    pub permissions: BTreeSet<Permission>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

/// Subset of the user handed back to the frontend alongside an access token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub email_verified: bool,
}

impl From<&User> for SessionUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            avatar_url: user.avatar_url.clone(),
            email_verified: user.email_verified,
        }
    }
}

/// Fields overwritten on every login; the IdP is the source of truth for all of them
#[derive(Debug, Clone)]
pub struct UserUpsert {
    pub external_id: String,
    pub email: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub email_verified: bool,
    pub roles: BTreeSet<Role>,
    pub permissions: BTreeSet<Permission>,
}

/// The IdP's own tokens, kept so the profile can be refreshed without a browser round trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTokenRecord {
    pub user_id: String,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

impl ProviderTokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// users + provider tokens (in-memory, doesn't persist)
#[derive(Clone, Default)]
pub struct InMemoryUserRepository {
    users: Arc<RwLock<HashMap<String, User>>>,
    /// external id -> internal id
    by_external_id: Arc<RwLock<HashMap<String, String>>>,
    provider_tokens: Arc<RwLock<HashMap<(String, String), ProviderTokenRecord>>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let by_external = self.by_external_id.read().await;
        let Some(id) = by_external.get(external_id) else {
            return Ok(None);
        };
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn upsert_user(&self, upsert: UserUpsert) -> Result<User> {
        // lock order: by_external_id then users, everywhere
        let mut by_external = self.by_external_id.write().await;
        let mut users = self.users.write().await;
        let now = Utc::now();

        let existing = by_external
            .get(&upsert.external_id)
            .and_then(|id| users.get(id))
            .cloned();

        let user = match existing {
            Some(prev) => User {
                email: upsert.email,
                username: upsert.username,
                first_name: upsert.first_name,
                last_name: upsert.last_name,
                avatar_url: upsert.avatar_url,
                email_verified: upsert.email_verified,
                roles: upsert.roles,
                permissions: upsert.permissions,
                updated_at: now,
                ..prev
            },
            None => User {
                id: Uuid::new_v4().to_string(),
                external_id: upsert.external_id,
                email: upsert.email,
                username: upsert.username,
                first_name: upsert.first_name,
                last_name: upsert.last_name,
                avatar_url: upsert.avatar_url,
                bio: None,
                email_verified: upsert.email_verified,
                status: UserStatus::Active,
                roles: upsert.roles,
                permissions: upsert.permissions,
                created_at: now,
                updated_at: now,
            },
        };

        by_external.insert(user.external_id.clone(), user.id.clone());
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn set_status(&self, id: &str, status: UserStatus) -> Result<Option<User>> {
        let mut users = self.users.write().await;
        Ok(users.get_mut(id).map(|user| {
            user.status = status;
            user.updated_at = Utc::now();
            user.clone()
        }))
    }

    async fn upsert_provider_token(&self, token: ProviderTokenRecord) -> Result<()> {
        let key = (token.user_id.clone(), token.provider.clone());
        self.provider_tokens.write().await.insert(key, token);
        Ok(())
    }

    async fn find_provider_token(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<ProviderTokenRecord>> {
        let key = (user_id.to_string(), provider.to_string());
        Ok(self.provider_tokens.read().await.get(&key).cloned())
    }
}
