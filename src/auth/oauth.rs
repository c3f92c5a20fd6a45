use super::error::AuthError;
use super::permissions::{RoleMapping, map_roles};
use super::provider::{IdentityClaims, KeycloakClient, ProviderTokens, extract_realm_roles};
use super::state_store::keys;
use super::token::generate_opaque_token;
use super::traits::{StateStore, UserRepository};
use super::users::{ProviderTokenRecord, User, UserUpsert};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

pub const PROVIDER_KEYCLOAK: &str = "keycloak";

/// How long a user has to come back from keycloak
pub const STATE_TTL: Duration = Duration::from_secs(5 * 60);

/// Where a login attempt got to; only used to say where it died
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStage {
    Initiated,
    AwaitingCallback,
    CodeExchanged,
    ClaimsFetched,
    UserUpserted,
    Complete,
}

#[derive(Debug, Clone)]
pub struct LoginRedirect {
    pub authorization_url: String,
    pub state: String,
}

/// Drives the authorization-code flow against the IdP
#[derive(Clone)]
pub struct OAuthFlow {
    provider: KeycloakClient,
    store: Arc<dyn StateStore + Send + Sync>,
    users: Arc<dyn UserRepository + Send + Sync>,
}

impl OAuthFlow {
    pub fn new(
        provider: KeycloakClient,
        store: Arc<dyn StateStore + Send + Sync>,
        users: Arc<dyn UserRepository + Send + Sync>,
    ) -> Self {
        Self {
            provider,
            store,
            users,
        }
    }

    pub fn provider(&self) -> &KeycloakClient {
        &self.provider
    }

    /// Fresh state, persisted before the URL is handed out
    pub async fn initiate(&self, provider: &str) -> Result<LoginRedirect, AuthError> {
        if provider != PROVIDER_KEYCLOAK {
            return Err(AuthError::UnsupportedProvider(provider.to_string()));
        }

        let state = generate_opaque_token(32);
        self.store
            .set(&keys::oauth_state(&state), provider, STATE_TTL)
            .await?;

        let authorization_url = self.provider.authorization_url(&state)?;
        tracing::debug!(stage = ?LoginStage::Initiated, "login state stored");

        Ok(LoginRedirect {
            authorization_url,
            state,
        })
    }

    /// Accepts the callback state only if the cookie and query agree AND the
    /// server still holds it. The server record is consumed, so a replay fails.
    /// Returns the provider the state was issued for.
    pub async fn consume_state(
        &self,
        cookie_state: Option<&str>,
        query_state: Option<&str>,
    ) -> Result<String, AuthError> {
        let (Some(cookie_state), Some(query_state)) = (cookie_state, query_state) else {
            tracing::warn!("state cookie or query parameter missing - possible CSRF");
            return Err(AuthError::InvalidState);
        };

        let matches: bool = cookie_state
            .as_bytes()
            .ct_eq(query_state.as_bytes())
            .into();
        if !matches || query_state.is_empty() {
            tracing::warn!("state cookie does not match query state - possible CSRF");
            return Err(AuthError::InvalidState);
        }

        match self.store.take(&keys::oauth_state(query_state)).await? {
            Some(provider) => {
                tracing::debug!(stage = ?LoginStage::AwaitingCallback, "state accepted");
                Ok(provider)
            }
            None => {
                tracing::warn!("state not found in store or expired");
                Err(AuthError::InvalidState)
            }
        }
    }

    /// code -> provider tokens -> claims -> roles -> upserted user
    pub async fn complete(&self, code: &str) -> Result<User, AuthError> {
        let tokens = self
            .provider
            .exchange_code(code)
            .await
            .inspect_err(|e| failed(LoginStage::AwaitingCallback, e))?;
        tracing::debug!(stage = ?LoginStage::CodeExchanged, "code exchanged");

        let claims = self
            .provider
            .fetch_claims(&tokens.access_token)
            .await
            .inspect_err(|e| failed(LoginStage::CodeExchanged, e))?;
        tracing::debug!(stage = ?LoginStage::ClaimsFetched, sub = %claims.sub, "claims fetched");

        let mapping = map_roles(extract_realm_roles(&tokens.access_token));

        let user = self
            .upsert_user(&claims, mapping, &tokens)
            .await
            .inspect_err(|e| failed(LoginStage::ClaimsFetched, e))?;
        tracing::debug!(stage = ?LoginStage::UserUpserted, user_id = %user.id, "user upserted");

        Ok(user)
    }

    /// Claims win over whatever we had; provider tokens are replaced too
    pub async fn upsert_user(
        &self,
        claims: &IdentityClaims,
        mapping: RoleMapping,
        tokens: &ProviderTokens,
    ) -> Result<User, AuthError> {
        let email = claims
            .email
            .clone()
            .ok_or_else(|| AuthError::ClaimsFetchFailed("userinfo has no email".to_string()))?;

        let user = self
            .users
            .upsert_user(UserUpsert {
                external_id: claims.sub.clone(),
                username: claims.username(),
                email,
                first_name: claims.given_name.clone(),
                last_name: claims.family_name.clone(),
                avatar_url: claims.picture.clone(),
                email_verified: claims.email_verified,
                roles: mapping.roles,
                permissions: mapping.permissions,
            })
            .await?;

        self.users
            .upsert_provider_token(ProviderTokenRecord {
                user_id: user.id.clone(),
                provider: PROVIDER_KEYCLOAK.to_string(),
                access_token: tokens.access_token.clone(),
                refresh_token: tokens.refresh_token.clone(),
                expires_at: tokens.expires_at(Utc::now()),
                scope: tokens.scope.clone(),
                token_type: tokens.token_type.clone(),
            })
            .await?;

        Ok(user)
    }

    /// Re-reads the profile with the stored provider tokens, no browser involved.
    /// An expired provider access token is refreshed first if we have a refresh token.
    pub async fn refresh_profile(&self, user_id: &str) -> Result<User, AuthError> {
        let record = self
            .users
            .find_provider_token(user_id, PROVIDER_KEYCLOAK)
            .await?
            .ok_or(AuthError::ProviderTokenMissing)?;

        let tokens = match (&record.refresh_token, record.is_expired(Utc::now())) {
            (Some(refresh_token), true) => {
                tracing::debug!(user_id, "stored provider token expired, refreshing");
                let fresh = self.provider.refresh_provider_tokens(refresh_token).await?;
                ProviderTokens {
                    // keycloak may not rotate the refresh token
                    refresh_token: fresh.refresh_token.or_else(|| record.refresh_token.clone()),
                    ..fresh
                }
            }
            _ => ProviderTokens {
                access_token: record.access_token.clone(),
                refresh_token: record.refresh_token.clone(),
                expires_in: record
                    .expires_at
                    .map(|at| (at - Utc::now()).num_seconds()),
                scope: record.scope.clone(),
                token_type: record.token_type.clone(),
            },
        };

        let claims = self.provider.fetch_claims(&tokens.access_token).await?;
        let mapping = map_roles(extract_realm_roles(&tokens.access_token));
        self.upsert_user(&claims, mapping, &tokens).await
    }
}

fn failed(stage: LoginStage, err: &AuthError) {
    tracing::error!(stage = ?stage, code = err.code(), "login failed: {}", err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::permissions::{Permission, Role};
    use crate::auth::state_store::InMemoryStateStore;
    use crate::auth::test_support::{
        fake_provider_token, mount_token_endpoint, mount_userinfo, provider_config,
    };
    use crate::auth::users::{InMemoryUserRepository, UserStatus};
    use std::collections::BTreeSet;
    use wiremock::MockServer;

    struct Harness {
        flow: OAuthFlow,
        store: Arc<InMemoryStateStore>,
        users: Arc<InMemoryUserRepository>,
    }

    fn harness(server_uri: &str) -> Harness {
        let store = Arc::new(InMemoryStateStore::new());
        let users = Arc::new(InMemoryUserRepository::new());
        let provider =
            KeycloakClient::new(provider_config(server_uri), Duration::from_secs(2)).unwrap();
        Harness {
            flow: OAuthFlow::new(provider, store.clone(), users.clone()),
            store,
            users,
        }
    }

    #[tokio::test]
    async fn test_initiate_persists_state() {
        let h = harness("http://kc.local");
        let redirect = h.flow.initiate("keycloak").await.unwrap();

        assert_eq!(redirect.state.len(), 64);
        assert_eq!(
            h.store
                .get(&keys::oauth_state(&redirect.state))
                .await
                .unwrap()
                .as_deref(),
            Some("keycloak")
        );
        assert!(redirect
            .authorization_url
            .contains(&format!("state={}", redirect.state)));
    }

    #[tokio::test]
    async fn test_initiate_rejects_unknown_provider() {
        let h = harness("http://kc.local");
        let err = h.flow.initiate("github").await.unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedProvider(_)));
        assert_eq!(h.store.len().await, 0);
    }

    #[tokio::test]
    async fn test_state_is_single_use() {
        let h = harness("http://kc.local");
        let state = h.flow.initiate("keycloak").await.unwrap().state;

        let provider = h
            .flow
            .consume_state(Some(&state), Some(&state))
            .await
            .unwrap();
        assert_eq!(provider, "keycloak");

        let replay = h.flow.consume_state(Some(&state), Some(&state)).await;
        assert!(matches!(replay, Err(AuthError::InvalidState)));
    }

    #[tokio::test]
    async fn test_state_must_match_cookie_even_if_stored() {
        let h = harness("http://kc.local");
        let victim = h.flow.initiate("keycloak").await.unwrap().state;
        let attacker = h.flow.initiate("keycloak").await.unwrap().state;

        let err = h
            .flow
            .consume_state(Some(&victim), Some(&attacker))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));

        // mismatch must not burn either record
        assert!(h.store.exists(&keys::oauth_state(&attacker)).await.unwrap());
        assert!(h.store.exists(&keys::oauth_state(&victim)).await.unwrap());
    }

    #[tokio::test]
    async fn test_state_missing_pieces() {
        let h = harness("http://kc.local");
        let state = h.flow.initiate("keycloak").await.unwrap().state;

        for (cookie, query) in [
            (None, Some(state.as_str())),
            (Some(state.as_str()), None),
            (None, None),
            (Some(""), Some("")),
        ] {
            assert!(matches!(
                h.flow.consume_state(cookie, query).await,
                Err(AuthError::InvalidState)
            ));
        }
    }

    #[tokio::test]
    async fn test_forged_cookie_without_server_record() {
        let h = harness("http://kc.local");
        let err = h
            .flow
            .consume_state(Some("forged"), Some("forged"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_record_lives_five_minutes() {
        let h = harness("http://kc.local");
        let state = h.flow.initiate("keycloak").await.unwrap().state;
        let key = keys::oauth_state(&state);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(h.store.exists(&key).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!h.store.exists(&key).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_state_is_rejected() {
        let h = harness("http://kc.local");
        let state = h.flow.initiate("keycloak").await.unwrap().state;

        tokio::time::advance(STATE_TTL + Duration::from_secs(1)).await;
        let err = h
            .flow
            .consume_state(Some(&state), Some(&state))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));
    }

    #[tokio::test]
    async fn test_complete_upserts_user_with_union_permissions() {
        let server = MockServer::start().await;
        let provider_token = fake_provider_token(&["moderator", "premium_user", "offline_access"]);
        mount_token_endpoint(&server, &provider_token).await;
        mount_userinfo(&server, "kc-1", "ada@example.com", "Ada").await;

        let h = harness(&server.uri());
        let user = h.flow.complete("code").await.unwrap();

        assert_eq!(user.external_id, "kc-1");
        assert_eq!(user.status, UserStatus::Active);
        assert_eq!(user.roles, BTreeSet::from([Role::Moderator, Role::PremiumUser]));
        assert!(user.permissions.contains(&Permission::NotificationSend));
        assert!(user.permissions.contains(&Permission::AiInterview));

        let record = h
            .users
            .find_provider_token(&user.id, PROVIDER_KEYCLOAK)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.access_token, provider_token);
        assert!(record.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_refresh_profile_without_tokens() {
        let h = harness("http://kc.local");
        let err = h.flow.refresh_profile("nobody").await.unwrap_err();
        assert!(matches!(err, AuthError::ProviderTokenMissing));
    }

    #[tokio::test]
    async fn test_refresh_profile_uses_stored_token() {
        let server = MockServer::start().await;
        let provider_token = fake_provider_token(&["user"]);
        mount_token_endpoint(&server, &provider_token).await;
        mount_userinfo(&server, "kc-1", "ada@example.com", "Ada").await;

        let h = harness(&server.uri());
        let user = h.flow.complete("code").await.unwrap();

        server.reset().await;
        mount_userinfo(&server, "kc-1", "ada@example.com", "Augusta").await;

        let refreshed = h.flow.refresh_profile(&user.id).await.unwrap();
        assert_eq!(refreshed.id, user.id);
        assert_eq!(refreshed.first_name.as_deref(), Some("Augusta"));
        assert_eq!(h.users.len().await, 1);
    }
}
