mod error;
mod handlers;
mod middleware;
mod oauth;
mod permissions;
mod provider;
mod response;
mod session;
mod state_store;
mod token;
mod traits;
mod users;

#[cfg(test)]
mod test_support;

pub use error::AuthError;
pub use handlers::AuthAppState;
pub use session::SessionService;
pub use state_store::{InMemoryStateStore, RedisStateStore};
pub use traits::StateStore;
pub use users::InMemoryUserRepository;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use std::time::Duration;

/// Name of the cookie carrying the login state between /login and /callback
pub const STATE_COOKIE: &str = "oauth_state";
/// Name of the cookie carrying the opaque refresh token
pub const REFRESH_COOKIE: &str = "gc_refresh";
/// Both cookies are scoped to the auth routes only
pub const COOKIE_PATH: &str = "/auth";

/// Attributes shared by every cookie we set. Secure is off for local http.
#[derive(Clone, Copy, Debug)]
pub struct CookieSettings {
    pub secure: bool,
}

impl CookieSettings {
    fn build(&self, name: &'static str, value: String, max_age: Duration) -> Cookie<'static> {
        Cookie::build((name, value))
            .path(COOKIE_PATH)
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(max_age.as_secs() as i64))
            .build()
    }

    pub fn state_cookie(&self, state: String) -> Cookie<'static> {
        self.build(STATE_COOKIE, state, oauth::STATE_TTL)
    }

    pub fn refresh_cookie(&self, token: String, ttl: Duration) -> Cookie<'static> {
        self.build(REFRESH_COOKIE, token, ttl)
    }

    /// Only needs name + path to match; the jar turns it into a removal
    pub fn removal(&self, name: &'static str) -> Cookie<'static> {
        Cookie::build(name).path(COOKIE_PATH).build()
    }
}

/// Where keycloak lives and how we identify ourselves to it
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Browser-facing base url (authorization + account pages)
    pub base_url: String,
    /// Server-to-server base url (token + userinfo); often a docker hostname
    pub internal_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    /// Must be registered with keycloak verbatim
    pub redirect_uri: String,
    pub account_redirect_uri: String,
}

impl ProviderConfig {
    fn realm_url(base: &str, realm: &str) -> String {
        format!("{}/realms/{}", base.trim_end_matches('/'), realm)
    }

    pub fn authorization_endpoint(&self) -> String {
        format!(
            "{}/protocol/openid-connect/auth",
            Self::realm_url(&self.base_url, &self.realm)
        )
    }

    pub fn token_endpoint(&self) -> String {
        format!(
            "{}/protocol/openid-connect/token",
            Self::realm_url(&self.internal_url, &self.realm)
        )
    }

    pub fn userinfo_endpoint(&self) -> String {
        format!(
            "{}/protocol/openid-connect/userinfo",
            Self::realm_url(&self.internal_url, &self.realm)
        )
    }

    pub fn account_endpoint(&self) -> String {
        format!("{}/account", Self::realm_url(&self.base_url, &self.realm))
    }
}

/// Configuration for the authentication system
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub provider: ProviderConfig,
    pub jwt_secret: String,
    pub access_token_ttl: Duration,
    /// Also the blacklist entry lifetime
    pub refresh_token_ttl: Duration,
    pub frontend_url: String,
    pub cookie_secure: bool,
    pub provider_timeout: Duration,
}

impl AuthConfig {
    /// Refuses to start on config that would produce unusable sessions
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.jwt_secret.trim().is_empty() {
            return Err(AuthError::Configuration(
                "JWT_SECRET must be set".to_string(),
            ));
        }
        if self.access_token_ttl.is_zero() || self.refresh_token_ttl.is_zero() {
            return Err(AuthError::Configuration(
                "token lifetimes must be greater than zero".to_string(),
            ));
        }
        if self.provider.client_id.is_empty() || self.provider.realm.is_empty() {
            return Err(AuthError::Configuration(
                "KEYCLOAK_CLIENT_ID and KEYCLOAK_REALM must be set".to_string(),
            ));
        }
        url::Url::parse(&self.frontend_url)
            .map_err(|e| AuthError::Configuration(format!("FRONTEND_URL is not a url: {}", e)))?;
        Ok(())
    }
}

/// Parses `900`, `900s`, `15m`, `12h` or `7d`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, AuthError> {
    let raw = raw.trim();
    let invalid = || AuthError::Configuration(format!("invalid duration: {:?}", raw));

    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Err(invalid()),
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Every auth route, nested under `/auth`. Layers (cors, tracing, rate limits)
/// are the caller's business.
pub fn router(state: AuthAppState) -> Router {
    // jwt required
    let protected = Router::new()
        .route(
            "/me",
            get(handlers::me_handler).delete(handlers::delete_me_handler),
        )
        .route("/account", get(handlers::account_handler))
        .route("/account/callback", get(handlers::account_callback_handler))
        .route("/admin/users/{id}/ban", post(handlers::ban_user_handler))
        .route("/admin/users/{id}/restore", post(handlers::restore_user_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::jwt_auth_middleware,
        ));

    // public - cookie or IdP driven
    let public = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/login", get(handlers::login_handler))
        .route("/login/{provider}", get(handlers::login_provider_handler))
        .route("/callback", get(handlers::callback_handler))
        .route("/refresh", post(handlers::refresh_handler))
        .route("/logout", post(handlers::logout_handler));

    Router::new().nest("/auth", public.merge(protected).with_state(state))
}
