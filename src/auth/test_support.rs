//! Fixtures shared by the auth unit tests

use super::ProviderConfig;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN_PATH: &str = "/realms/gitcode/protocol/openid-connect/token";
pub const USERINFO_PATH: &str = "/realms/gitcode/protocol/openid-connect/userinfo";

pub fn provider_config(server_uri: &str) -> ProviderConfig {
    ProviderConfig {
        base_url: server_uri.to_string(),
        internal_url: server_uri.to_string(),
        realm: "gitcode".to_string(),
        client_id: "gitcode-web".to_string(),
        client_secret: "kc-secret".to_string(),
        redirect_uri: "http://localhost:4001/auth/callback".to_string(),
        account_redirect_uri: "http://localhost:4001/auth/account/callback".to_string(),
    }
}

/// Unsigned keycloak-shaped access token carrying the given realm roles
pub fn fake_provider_token(realm_roles: &[&str]) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = serde_json::json!({
        "sub": "kc-1",
        "realm_access": { "roles": realm_roles },
    });
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.not-a-real-signature", header, payload)
}

pub async fn mount_token_endpoint(server: &MockServer, provider_access_token: &str) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": provider_access_token,
            "refresh_token": "provider-rt",
            "expires_in": 300,
            "token_type": "Bearer",
            "scope": "openid profile email"
        })))
        .mount(server)
        .await;
}

pub async fn mount_userinfo(server: &MockServer, sub: &str, email: &str, given_name: &str) {
    Mock::given(method("GET"))
        .and(path(USERINFO_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "sub": sub,
            "email": email,
            "preferred_username": email.split('@').next().unwrap_or(sub),
            "given_name": given_name,
            "family_name": "Lovelace",
            "email_verified": true
        })))
        .mount(server)
        .await;
}
