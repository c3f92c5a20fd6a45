use super::ProviderConfig;
use super::error::AuthError;
use anyhow::Context;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use url::Url;

pub const SCOPES: &str = "openid profile email";

/// What the token endpoint hands back
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

impl ProviderTokens {
    /// None when keycloak sent no expiry, or one chrono can't represent
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let lifetime = TimeDelta::try_seconds(self.expires_in?)?;
        now.checked_add_signed(lifetime)
    }
}

/// userinfo response. Only `sub` is guaranteed by OIDC.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,
    pub email: Option<String>,
    pub preferred_username: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub picture: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
}

impl IdentityClaims {
    /// preferred_username, else the local part of the email, else the subject
    pub fn username(&self) -> String {
        if let Some(name) = self.preferred_username.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        self.email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .filter(|local| !local.is_empty())
            .unwrap_or(self.sub.as_str())
            .to_string()
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenPayload {
    realm_access: Option<RealmAccess>,
}

#[derive(Debug, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

/// Talks to keycloak's openid-connect endpoints. One attempt per call, no retries:
/// codes are single use and a retry would only hide the real error.
#[derive(Clone)]
pub struct KeycloakClient {
    client: Client,
    config: ProviderConfig,
}

impl KeycloakClient {
    pub fn new(config: ProviderConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;

        Ok(Self { client, config })
    }

    /// Browser-facing authorization URL for a given CSRF state
    pub fn authorization_url(&self, state: &str) -> anyhow::Result<String> {
        let mut url = Url::parse(&self.config.authorization_endpoint())
            .context("invalid keycloak authorization endpoint")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", SCOPES)
            .append_pair("state", state);
        Ok(url.into())
    }

    /// Self-service account page; keycloak sends the user back to `referrer_uri`
    pub fn account_url(&self) -> anyhow::Result<String> {
        let mut url =
            Url::parse(&self.config.account_endpoint()).context("invalid keycloak account url")?;
        url.query_pairs_mut()
            .append_pair("referrer", &self.config.client_id)
            .append_pair("referrer_uri", &self.config.account_redirect_uri);
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        self.token_request(&form).await
    }

    /// refresh_token grant against the IdP (its tokens, not ours)
    pub async fn refresh_provider_tokens(
        &self,
        refresh_token: &str,
    ) -> Result<ProviderTokens, AuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        self.token_request(&form).await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<ProviderTokens, AuthError> {
        let response = self
            .client
            .post(self.config.token_endpoint())
            .form(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("keycloak token endpoint unreachable: {}", e);
                AuthError::TokenExchangeFailed(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<ProviderTokens>().await.map_err(|e| {
                tracing::error!("unparseable token response: {}", e);
                AuthError::TokenExchangeFailed(e.to_string())
            });
        }

        let body = response.json::<OAuthErrorBody>().await.ok();
        tracing::error!(
            status = %status,
            error = body.as_ref().map(|b| b.error.as_str()).unwrap_or("-"),
            description = body
                .as_ref()
                .and_then(|b| b.error_description.as_deref())
                .unwrap_or("-"),
            "token exchange rejected"
        );

        match body {
            Some(body) if status == StatusCode::BAD_REQUEST && body.error == "invalid_grant" => {
                Err(AuthError::CodeExpiredOrReused)
            }
            _ => Err(AuthError::TokenExchangeFailed(format!(
                "token endpoint returned {}",
                status
            ))),
        }
    }

    pub async fn fetch_claims(&self, access_token: &str) -> Result<IdentityClaims, AuthError> {
        let response = self
            .client
            .get(self.config.userinfo_endpoint())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("keycloak userinfo endpoint unreachable: {}", e);
                AuthError::ClaimsFetchFailed(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, "userinfo request rejected");
            return Err(AuthError::ClaimsFetchFailed(format!(
                "userinfo endpoint returned {}",
                status
            )));
        }

        response
            .json::<IdentityClaims>()
            .await
            .map_err(|e| AuthError::ClaimsFetchFailed(e.to_string()))
    }
}

/// Reads `realm_access.roles` out of the provider's access token WITHOUT checking
/// its signature. We just got this token from keycloak over TLS on the back
/// channel; it never passed through the browser. Anything malformed gives no roles.
pub fn extract_realm_roles(access_token: &str) -> BTreeSet<String> {
    let Some(payload) = access_token.split('.').nth(1) else {
        return BTreeSet::new();
    };

    let decoded = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("provider access token payload is not base64url: {}", e);
            return BTreeSet::new();
        }
    };

    match serde_json::from_slice::<AccessTokenPayload>(&decoded) {
        Ok(payload) => payload
            .realm_access
            .map(|access| access.roles.into_iter().collect())
            .unwrap_or_default(),
        Err(e) => {
            tracing::warn!("provider access token payload is not json: {}", e);
            BTreeSet::new()
        }
    }
}
