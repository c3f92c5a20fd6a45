use super::AuthConfig;
use super::error::AuthError;
use super::oauth::{LoginRedirect, LoginStage, OAuthFlow};
use super::provider::KeycloakClient;
use super::token::{Blacklist, JwtTokenIssuer, JwtTokenValidator, RefreshTokens};
use super::traits::{AccessClaims, AccessToken, StateStore, TokenIssuer, TokenValidator, UserRepository};
use super::users::{User, UserStatus};
use serde::Serialize;
use std::sync::Arc;

/// What a successful login or refresh hands out
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub access: AccessToken,
    pub refresh_token: String,
    pub user: User,
}

/// Verified bearer: the token's claims plus the live user record
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub claims: AccessClaims,
    pub user: User,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountUpdateOutcome {
    pub success: bool,
    pub message: String,
}

/// Every session operation, transport-agnostic. Handlers decide cookies vs json.
#[derive(Clone)]
pub struct SessionService {
    oauth: OAuthFlow,
    users: Arc<dyn UserRepository + Send + Sync>,
    token_issuer: Arc<dyn TokenIssuer + Send + Sync>,
    token_validator: Arc<dyn TokenValidator + Send + Sync>,
    refresh_tokens: RefreshTokens,
    blacklist: Blacklist,
}

impl SessionService {
    pub fn new(
        config: &AuthConfig,
        store: Arc<dyn StateStore + Send + Sync>,
        users: Arc<dyn UserRepository + Send + Sync>,
    ) -> anyhow::Result<Self> {
        let provider = KeycloakClient::new(config.provider.clone(), config.provider_timeout)?;

        Ok(Self {
            oauth: OAuthFlow::new(provider, store.clone(), users.clone()),
            users,
            token_issuer: Arc::new(JwtTokenIssuer::new(
                &config.jwt_secret,
                config.access_token_ttl,
            )),
            token_validator: Arc::new(JwtTokenValidator::new(&config.jwt_secret)),
            refresh_tokens: RefreshTokens::new(store.clone(), config.refresh_token_ttl),
            // outlives any refresh token issued before the ban
            blacklist: Blacklist::new(store, config.refresh_token_ttl),
        })
    }

    pub fn refresh_token_ttl(&self) -> std::time::Duration {
        self.refresh_tokens.ttl()
    }

    pub async fn initiate_login(&self, provider: &str) -> Result<LoginRedirect, AuthError> {
        self.oauth.initiate(provider).await
    }

    /// Callback after the IdP reported success: code check, state check, then
    /// the full exchange and token issuance
    pub async fn handle_callback(
        &self,
        code: Option<&str>,
        query_state: Option<&str>,
        cookie_state: Option<&str>,
    ) -> Result<IssuedSession, AuthError> {
        let code = code.filter(|c| !c.is_empty()).ok_or(AuthError::MissingCode)?;
        self.oauth.consume_state(cookie_state, query_state).await?;

        let user = self.oauth.complete(code).await?;
        self.ensure_allowed(&user).await?;

        let session = self.issue_session(user).await?;
        tracing::info!(
            stage = ?LoginStage::Complete,
            user_id = %session.user.id,
            "login complete"
        );
        Ok(session)
    }

    /// Redeem the presented refresh token and hand out a fresh pair.
    /// The old token is gone as soon as it is redeemed, whatever happens next.
    pub async fn refresh(&self, refresh_token: Option<&str>) -> Result<IssuedSession, AuthError> {
        let refresh_token = refresh_token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::NoRefreshToken)?;

        let user_id = self.refresh_tokens.redeem(refresh_token).await?;
        let user = self.validate_user(&user_id).await?;

        let session = self.issue_session(user).await?;
        tracing::debug!(user_id = %session.user.id, "refresh token rotated");
        Ok(session)
    }

    /// Best effort: the caller clears the cookie regardless
    pub async fn logout(&self, refresh_token: Option<&str>) {
        let Some(token) = refresh_token.filter(|t| !t.is_empty()) else {
            return;
        };
        if let Err(e) = self.refresh_tokens.revoke(token).await {
            tracing::error!("failed to revoke refresh token on logout: {:#}", e);
        }
    }

    /// Verifies the bearer and re-checks the user behind it
    pub async fn authenticate(&self, bearer: &str) -> Result<AuthenticatedUser, AuthError> {
        let claims = self.token_validator.validate_token(bearer).map_err(|e| {
            tracing::debug!("rejected access token: {}", e);
            AuthError::InvalidAccessToken
        })?;
        let user = self.validate_user(&claims.sub).await?;
        Ok(AuthenticatedUser { claims, user })
    }

    /// Blacklist first: a ban must win even while the user row says otherwise
    pub async fn validate_user(&self, user_id: &str) -> Result<User, AuthError> {
        if self.blacklist.contains(user_id).await? {
            tracing::warn!(user_id, "blacklisted user presented a credential");
            return Err(AuthError::UserBlacklisted);
        }

        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        if !user.is_active() {
            tracing::warn!(user_id, status = ?user.status, "inactive user presented a credential");
            return Err(AuthError::UserInactive);
        }

        Ok(user)
    }

    pub fn account_update_url(&self) -> Result<String, AuthError> {
        Ok(self.oauth.provider().account_url()?)
    }

    /// Never fails outward; the browser just gets told whether it worked
    pub async fn complete_account_update(&self, user_id: &str) -> AccountUpdateOutcome {
        match self.oauth.refresh_profile(user_id).await {
            Ok(user) => {
                tracing::info!(user_id = %user.id, "profile refreshed from provider");
                AccountUpdateOutcome {
                    success: true,
                    message: "Profile updated successfully".to_string(),
                }
            }
            Err(e) => {
                tracing::warn!(user_id, code = e.code(), "account update failed: {}", e);
                AccountUpdateOutcome {
                    success: false,
                    message: "Failed to update profile".to_string(),
                }
            }
        }
    }

    /// Marks the user banned and blacklists them. Outstanding refresh tokens are
    /// not hunted down; the blacklist check in `refresh` stops them, and access
    /// tokens already out there die on their own expiry.
    pub async fn ban_user(&self, user_id: &str) -> Result<User, AuthError> {
        let user = self
            .users
            .set_status(user_id, UserStatus::Banned)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        self.blacklist.add(user_id).await?;
        tracing::info!(user_id, "user banned");
        Ok(user)
    }

    pub async fn restore_user(&self, user_id: &str) -> Result<User, AuthError> {
        let user = self
            .users
            .set_status(user_id, UserStatus::Active)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        self.blacklist.remove(user_id).await?;
        tracing::info!(user_id, "user restored");
        Ok(user)
    }

    /// Soft delete; the presented refresh token goes with it
    pub async fn delete_account(
        &self,
        user_id: &str,
        refresh_token: Option<&str>,
    ) -> Result<User, AuthError> {
        let user = self
            .users
            .set_status(user_id, UserStatus::Deleted)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        self.logout(refresh_token).await;
        tracing::info!(user_id, "account soft-deleted");
        Ok(user)
    }

    async fn ensure_allowed(&self, user: &User) -> Result<(), AuthError> {
        if self.blacklist.contains(&user.id).await? {
            return Err(AuthError::UserBlacklisted);
        }
        if !user.is_active() {
            return Err(AuthError::UserInactive);
        }
        Ok(())
    }

    async fn issue_session(&self, user: User) -> Result<IssuedSession, AuthError> {
        let access = self.token_issuer.issue_access_token(&user)?;
        let refresh_token = self.refresh_tokens.issue(&user.id).await?;
        Ok(IssuedSession {
            access,
            refresh_token,
            user,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::permissions::Permission;
    use crate::auth::state_store::{InMemoryStateStore, keys};
    use crate::auth::test_support::{
        fake_provider_token, mount_token_endpoint, mount_userinfo, provider_config,
    };
    use crate::auth::users::InMemoryUserRepository;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::time::Duration;
    use wiremock::MockServer;

    pub(crate) fn test_config(server_uri: &str) -> AuthConfig {
        AuthConfig {
            provider: provider_config(server_uri),
            jwt_secret: "test-signing-secret".to_string(),
            access_token_ttl: Duration::from_secs(15 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            frontend_url: "http://localhost:3000".to_string(),
            cookie_secure: false,
            provider_timeout: Duration::from_secs(2),
        }
    }

    struct Harness {
        sessions: SessionService,
        store: Arc<InMemoryStateStore>,
        users: Arc<InMemoryUserRepository>,
        server: MockServer,
    }

    async fn harness(realm_roles: &[&str]) -> Harness {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, &fake_provider_token(realm_roles)).await;
        mount_userinfo(&server, "kc-1", "ada@example.com", "Ada").await;

        let store = Arc::new(InMemoryStateStore::new());
        let users = Arc::new(InMemoryUserRepository::new());
        let sessions =
            SessionService::new(&test_config(&server.uri()), store.clone(), users.clone())
                .unwrap();
        Harness {
            sessions,
            store,
            users,
            server,
        }
    }

    async fn login(h: &Harness) -> IssuedSession {
        let state = h.sessions.initiate_login("keycloak").await.unwrap().state;
        h.sessions
            .handle_callback(Some("code"), Some(&state), Some(&state))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_callback_issues_session() {
        let h = harness(&["user"]).await;
        let session = login(&h).await;

        assert_eq!(session.refresh_token.len(), 128);
        assert_eq!(
            h.store
                .get(&keys::refresh_token(&session.refresh_token))
                .await
                .unwrap()
                .as_deref(),
            Some(session.user.id.as_str())
        );

        let who = h
            .sessions
            .authenticate(&session.access.access_token)
            .await
            .unwrap();
        assert_eq!(who.user.id, session.user.id);
        assert!(who.claims.permissions.contains(&Permission::UserReadSelf));
    }

    #[tokio::test]
    async fn test_callback_missing_code_checked_first() {
        let h = harness(&["user"]).await;
        let err = h
            .sessions
            .handle_callback(None, Some("s"), Some("s"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingCode));
        // nothing reached the provider
        assert!(h.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_callback_replay_fails() {
        let h = harness(&["user"]).await;
        let state = h.sessions.initiate_login("keycloak").await.unwrap().state;
        h.sessions
            .handle_callback(Some("code"), Some(&state), Some(&state))
            .await
            .unwrap();

        let replay = h
            .sessions
            .handle_callback(Some("code"), Some(&state), Some(&state))
            .await;
        assert!(matches!(replay, Err(AuthError::InvalidState)));
    }

    #[tokio::test]
    async fn test_repeat_login_updates_same_user() {
        let h = harness(&["user"]).await;
        let first = login(&h).await;

        h.server.reset().await;
        mount_token_endpoint(&h.server, &fake_provider_token(&["user", "instructor"])).await;
        mount_userinfo(&h.server, "kc-1", "ada@lovelace.dev", "Augusta").await;

        let second = login(&h).await;
        assert_eq!(first.user.id, second.user.id);
        assert_eq!(h.users.len().await, 1);
        assert_eq!(second.user.email, "ada@lovelace.dev");
        assert_eq!(second.user.first_name.as_deref(), Some("Augusta"));
        assert!(second.user.permissions.contains(&Permission::ProblemCreate));
    }

    #[tokio::test]
    async fn test_banned_user_cannot_log_in() {
        let h = harness(&["user"]).await;
        let session = login(&h).await;
        h.sessions.ban_user(&session.user.id).await.unwrap();

        let state = h.sessions.initiate_login("keycloak").await.unwrap().state;
        let err = h
            .sessions
            .handle_callback(Some("code"), Some(&state), Some(&state))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserBlacklisted));
    }

    #[tokio::test]
    async fn test_refresh_rotates() {
        let h = harness(&["user"]).await;
        let first = login(&h).await;

        let second = h.sessions.refresh(Some(&first.refresh_token)).await.unwrap();
        assert_ne!(first.refresh_token, second.refresh_token);
        assert_eq!(first.user.id, second.user.id);

        let stale = h.sessions.refresh(Some(&first.refresh_token)).await;
        assert!(matches!(stale, Err(AuthError::InvalidRefreshToken)));

        // the new one still works
        h.sessions.refresh(Some(&second.refresh_token)).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_refresh_with_same_token() {
        let h = harness(&["user"]).await;
        let session = login(&h).await;

        let (a, b) = tokio::join!(
            h.sessions.refresh(Some(&session.refresh_token)),
            h.sessions.refresh(Some(&session.refresh_token)),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn test_refresh_without_token() {
        let h = harness(&["user"]).await;
        assert!(matches!(
            h.sessions.refresh(None).await,
            Err(AuthError::NoRefreshToken)
        ));
        assert!(matches!(
            h.sessions.refresh(Some("")).await,
            Err(AuthError::NoRefreshToken)
        ));
        assert!(matches!(
            h.sessions.refresh(Some("made-up")).await,
            Err(AuthError::InvalidRefreshToken)
        ));
    }

    #[tokio::test]
    async fn test_blacklist_blocks_refresh() {
        let h = harness(&["user"]).await;
        let session = login(&h).await;

        h.sessions.ban_user(&session.user.id).await.unwrap();
        let err = h
            .sessions
            .refresh(Some(&session.refresh_token))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserBlacklisted));

        // the access token is still a valid signature but the guard re-checks
        let err = h
            .sessions
            .authenticate(&session.access.access_token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserBlacklisted));
    }

    #[tokio::test]
    async fn test_blacklist_alone_blocks_refresh() {
        let h = harness(&["user"]).await;
        let session = login(&h).await;

        // entry written by something else, user row untouched
        h.store
            .set(
                &keys::blacklisted_user(&session.user.id),
                "now",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let err = h
            .sessions
            .refresh(Some(&session.refresh_token))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserBlacklisted));
    }

    #[tokio::test]
    async fn test_inactive_user_cannot_refresh() {
        let h = harness(&["user"]).await;
        let session = login(&h).await;
        h.users
            .set_status(&session.user.id, UserStatus::Deleted)
            .await
            .unwrap();

        let err = h
            .sessions
            .refresh(Some(&session.refresh_token))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserInactive));
    }

    #[tokio::test]
    async fn test_restore_lifts_ban() {
        let h = harness(&["user"]).await;
        let session = login(&h).await;

        h.sessions.ban_user(&session.user.id).await.unwrap();
        let restored = h.sessions.restore_user(&session.user.id).await.unwrap();
        assert_eq!(restored.status, UserStatus::Active);

        let again = login(&h).await;
        h.sessions.refresh(Some(&again.refresh_token)).await.unwrap();
    }

    #[tokio::test]
    async fn test_ban_unknown_user() {
        let h = harness(&["user"]).await;
        assert!(matches!(
            h.sessions.ban_user("ghost").await,
            Err(AuthError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn test_logout_revokes() {
        let h = harness(&["user"]).await;
        let session = login(&h).await;

        h.sessions.logout(Some(&session.refresh_token)).await;
        assert!(matches!(
            h.sessions.refresh(Some(&session.refresh_token)).await,
            Err(AuthError::InvalidRefreshToken)
        ));
        // no cookie is fine too
        h.sessions.logout(None).await;
    }

    #[tokio::test]
    async fn test_delete_account() {
        let h = harness(&["user"]).await;
        let session = login(&h).await;

        let deleted = h
            .sessions
            .delete_account(&session.user.id, Some(&session.refresh_token))
            .await
            .unwrap();
        assert_eq!(deleted.status, UserStatus::Deleted);
        assert!(!h
            .store
            .exists(&keys::refresh_token(&session.refresh_token))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_account_update_reports_failure_without_throwing() {
        let h = harness(&["user"]).await;
        let outcome = h.sessions.complete_account_update("no-such-user").await;
        assert!(!outcome.success);

        let session = login(&h).await;
        h.server.reset().await;
        // userinfo now broken
        let outcome = h.sessions.complete_account_update(&session.user.id).await;
        assert!(!outcome.success);

        mount_userinfo(&h.server, "kc-1", "ada@example.com", "Countess").await;
        let outcome = h.sessions.complete_account_update(&session.user.id).await;
        assert!(outcome.success);
        let user = h.sessions.validate_user(&session.user.id).await.unwrap();
        assert_eq!(user.first_name.as_deref(), Some("Countess"));
    }

    /// Store whose deletes always fail
    struct BrokenDeleteStore(InMemoryStateStore);

    #[async_trait]
    impl StateStore for BrokenDeleteStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
            self.0.set(key, value, ttl).await
        }
        async fn del(&self, _key: &str) -> anyhow::Result<()> {
            Err(anyhow!("redis went away"))
        }
        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            self.0.exists(key).await
        }
        async fn take(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.0.take(key).await
        }
    }

    #[tokio::test]
    async fn test_logout_swallows_store_failure() {
        let sessions = SessionService::new(
            &test_config("http://kc.local"),
            Arc::new(BrokenDeleteStore(InMemoryStateStore::new())),
            Arc::new(InMemoryUserRepository::new()),
        )
        .unwrap();
        // must not panic or error
        sessions.logout(Some("whatever")).await;
    }
}
