use super::error::AuthError;
use super::oauth::PROVIDER_KEYCLOAK;
use super::permissions::{Operation, authorize};
use super::response::{ApiResponse, error_response};
use super::session::{AuthenticatedUser, SessionService};
use super::traits::AccessToken;
use super::users::{SessionUser, User};
use super::{CookieSettings, REFRESH_COOKIE, STATE_COOKIE};
use axum::{
    Extension,
    extract::{OriginalUri, Path, Query, State},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared by every auth handler and the bearer middleware
#[derive(Clone)]
pub struct AuthAppState {
    pub sessions: Arc<SessionService>,
    pub cookies: CookieSettings,
    pub frontend_url: String,
}

impl AuthAppState {
    fn frontend(&self, path_and_query: &str) -> String {
        format!("{}{}", self.frontend_url.trim_end_matches('/'), path_and_query)
    }

    /// `{frontend}/login?error=...`, the only way browser flows report failure
    fn login_error(&self, code: &str) -> Redirect {
        Redirect::to(&self.frontend(&format!("/login?error={}", urlencoding::encode(code))))
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RefreshData {
    #[serde(flatten)]
    pub token: AccessToken,
    pub user: SessionUser,
}

#[derive(Debug, Serialize)]
pub struct MessageData {
    pub message: &'static str,
}

/// Handler for GET /auth/health
pub async fn health_handler(OriginalUri(uri): OriginalUri) -> Response {
    ApiResponse::ok(
        "Auth Service is healthy",
        HealthStatus {
            status: "Auth Service is healthy",
        },
        uri.path(),
    )
    .into_response()
}

/// Handler for GET /auth/login?provider=
pub async fn login_handler(
    State(state): State<AuthAppState>,
    Query(params): Query<LoginParams>,
    jar: CookieJar,
) -> Response {
    let provider = params.provider.as_deref().unwrap_or(PROVIDER_KEYCLOAK);
    start_login(&state, provider, jar).await
}

/// Handler for GET /auth/login/{provider}
pub async fn login_provider_handler(
    State(state): State<AuthAppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
) -> Response {
    start_login(&state, &provider, jar).await
}

async fn start_login(state: &AuthAppState, provider: &str, jar: CookieJar) -> Response {
    match state.sessions.initiate_login(provider).await {
        Ok(login) => {
            tracing::info!(provider, "redirecting to identity provider");
            let jar = jar.add(state.cookies.state_cookie(login.state));
            (jar, Redirect::to(&login.authorization_url)).into_response()
        }
        Err(e) => {
            tracing::warn!(provider, code = e.code(), "login initiation failed: {}", e);
            state.login_error(e.redirect_code()).into_response()
        }
    }
}

/// Handler for GET /auth/callback
///
/// Every outcome is a redirect. The state cookie is single use so it is cleared
/// whatever happens; tokens never appear in the redirect url.
pub async fn callback_handler(
    State(state): State<AuthAppState>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Response {
    let cookie_state = jar.get(STATE_COOKIE).map(|c| c.value().to_string());
    let jar = jar.remove(state.cookies.removal(STATE_COOKIE));

    if let Some(error) = params.error.as_deref() {
        let description = params
            .error_description
            .as_deref()
            .unwrap_or("Unknown error");
        tracing::warn!(error, description, "identity provider returned an error");
        let location = state.frontend(&format!(
            "/login?error={}&description={}",
            urlencoding::encode(error),
            urlencoding::encode(description)
        ));
        return (jar, Redirect::to(&location)).into_response();
    }

    let result = state
        .sessions
        .handle_callback(
            params.code.as_deref(),
            params.state.as_deref(),
            cookie_state.as_deref(),
        )
        .await;

    match result {
        Ok(session) => {
            let jar = jar.add(
                state
                    .cookies
                    .refresh_cookie(session.refresh_token, state.sessions.refresh_token_ttl()),
            );
            // frontend calls POST /auth/refresh next to get the access token
            (jar, Redirect::to(&state.frontend("/auth/callback?success=true"))).into_response()
        }
        Err(e) => {
            if e.status().is_server_error() {
                tracing::error!(code = e.code(), "callback failed: {:#}", e);
            }
            (jar, state.login_error(e.redirect_code())).into_response()
        }
    }
}

/// Handler for POST /auth/refresh
pub async fn refresh_handler(
    State(state): State<AuthAppState>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
) -> Response {
    let presented = jar.get(REFRESH_COOKIE).map(|c| c.value().to_string());

    match state.sessions.refresh(presented.as_deref()).await {
        Ok(session) => {
            let data = RefreshData {
                token: session.access,
                user: SessionUser::from(&session.user),
            };
            let jar = jar.add(
                state
                    .cookies
                    .refresh_cookie(session.refresh_token, state.sessions.refresh_token_ttl()),
            );
            (
                jar,
                ApiResponse::ok("Token refreshed successfully", data, uri.path()),
            )
                .into_response()
        }
        // store outage: the token was never looked at, so the browser keeps it
        Err(e @ AuthError::Internal(_)) => error_response(&e, uri.path()),
        Err(e) => {
            // the presented token is burnt or was never valid
            let jar = jar.remove(state.cookies.removal(REFRESH_COOKIE));
            (jar, error_response(&e, uri.path())).into_response()
        }
    }
}

/// Handler for POST /auth/logout. Always succeeds.
pub async fn logout_handler(
    State(state): State<AuthAppState>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
) -> Response {
    let presented = jar.get(REFRESH_COOKIE).map(|c| c.value().to_string());
    state.sessions.logout(presented.as_deref()).await;

    let jar = jar.remove(state.cookies.removal(REFRESH_COOKIE));
    (
        jar,
        ApiResponse::ok(
            "Logged out successfully",
            MessageData {
                message: "Logged out successfully",
            },
            uri.path(),
        ),
    )
        .into_response()
}

/// Handler for GET /auth/me
pub async fn me_handler(
    OriginalUri(uri): OriginalUri,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Response {
    if let Err(e) = require(Operation::ViewProfile, &auth) {
        return error_response(&e, uri.path());
    }
    ApiResponse::ok("User profile retrieved successfully", auth.user, uri.path()).into_response()
}

/// Handler for DELETE /auth/me (soft delete)
pub async fn delete_me_handler(
    State(state): State<AuthAppState>,
    OriginalUri(uri): OriginalUri,
    Extension(auth): Extension<AuthenticatedUser>,
    jar: CookieJar,
) -> Response {
    if let Err(e) = require(Operation::DeleteOwnAccount, &auth) {
        return error_response(&e, uri.path());
    }

    let presented = jar.get(REFRESH_COOKIE).map(|c| c.value().to_string());
    match state
        .sessions
        .delete_account(&auth.user.id, presented.as_deref())
        .await
    {
        Ok(user) => {
            let jar = jar.remove(state.cookies.removal(REFRESH_COOKIE));
            (
                jar,
                ApiResponse::ok("Account deleted successfully", user, uri.path()),
            )
                .into_response()
        }
        Err(e) => error_response(&e, uri.path()),
    }
}

/// Handler for GET /auth/account: off to keycloak's self-service page
pub async fn account_handler(
    State(state): State<AuthAppState>,
    OriginalUri(uri): OriginalUri,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Response {
    if let Err(e) = require(Operation::UpdateAccount, &auth) {
        return error_response(&e, uri.path());
    }

    match state.sessions.account_update_url() {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(e) => {
            tracing::error!("failed to build account url: {:#}", e);
            state.login_error(e.redirect_code()).into_response()
        }
    }
}

/// Handler for GET /auth/account/callback
pub async fn account_callback_handler(
    State(state): State<AuthAppState>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Response {
    let success = match require(Operation::UpdateAccount, &auth) {
        Ok(()) => {
            state
                .sessions
                .complete_account_update(&auth.user.id)
                .await
                .success
        }
        Err(_) => false,
    };

    let outcome = if success { "success" } else { "failure" };
    Redirect::to(&state.frontend(&format!("/account?update={}", outcome))).into_response()
}

/// Handler for POST /auth/admin/users/{id}/ban
pub async fn ban_user_handler(
    State(state): State<AuthAppState>,
    OriginalUri(uri): OriginalUri,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Response {
    admin_action(
        Operation::BanUser,
        &auth,
        uri.path(),
        "User banned successfully",
        state.sessions.ban_user(&user_id),
    )
    .await
}

/// Handler for POST /auth/admin/users/{id}/restore
pub async fn restore_user_handler(
    State(state): State<AuthAppState>,
    OriginalUri(uri): OriginalUri,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Response {
    admin_action(
        Operation::RestoreUser,
        &auth,
        uri.path(),
        "User restored successfully",
        state.sessions.restore_user(&user_id),
    )
    .await
}

async fn admin_action(
    operation: Operation,
    auth: &AuthenticatedUser,
    path: &str,
    message: &'static str,
    action: impl Future<Output = Result<User, AuthError>>,
) -> Response {
    // checked before the action future is ever polled
    if let Err(e) = require(operation, auth) {
        return error_response(&e, path);
    }
    match action.await {
        Ok(user) => {
            tracing::info!(
                actor = %auth.user.id,
                user_id = %user.id,
                ?operation,
                "admin action applied"
            );
            ApiResponse::ok(message, user, path).into_response()
        }
        Err(e) => error_response(&e, path),
    }
}

/// Permission gate against the permissions the access token was minted with
fn require(operation: Operation, auth: &AuthenticatedUser) -> Result<(), AuthError> {
    if authorize(operation, &auth.claims.permissions) {
        Ok(())
    } else {
        tracing::warn!(user_id = %auth.user.id, ?operation, "permission denied");
        Err(AuthError::Forbidden)
    }
}
