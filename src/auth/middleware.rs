use super::error::AuthError;
use super::handlers::AuthAppState;
use super::response::ApiResponse;
use axum::{
    extract::{OriginalUri, Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Bearer-token gate for the protected routes. On success the request carries an
/// `AuthenticatedUser` extension; handlers pull it out with `Extension`.
pub async fn jwt_auth_middleware(
    State(state): State<AuthAppState>,
    mut req: Request,
    next: Next,
) -> Response {
    // nested routers strip the /auth prefix from req.uri()
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    // scheme is case-sensitive here, keycloak and the frontend both send "Bearer"
    let token = match auth_header {
        Some(header) if header.starts_with("Bearer ") => header[7..].trim().to_string(),
        _ => {
            tracing::debug!(
                "Missing or invalid Authorization header for {} {}",
                req.method(),
                path
            );
            return unauthorized_response(&AuthError::InvalidAccessToken, &path, None);
        }
    };

    match state.sessions.authenticate(&token).await {
        Ok(authenticated) => {
            tracing::debug!(user_id = %authenticated.user.id, "bearer accepted");
            req.extensions_mut().insert(authenticated);
            next.run(req).await
        }
        Err(err @ AuthError::Internal(_)) => {
            // store trouble is not the caller's fault
            super::response::error_response(&err, &path)
        }
        Err(err) => {
            tracing::warn!(code = err.code(), "rejected bearer for {}: {}", path, err);
            unauthorized_response(&err, &path, Some("invalid_token"))
        }
    }
}

/// 401 envelope plus a WWW-Authenticate header so clients know to go refresh
fn unauthorized_response(err: &AuthError, path: &str, error: Option<&str>) -> Response {
    let www_auth = match error {
        Some(err) => format!("Bearer realm=\"gitcode\", error=\"{}\"", err),
        None => "Bearer realm=\"gitcode\"".to_string(),
    };

    let mut response = ApiResponse::from_error(err, path).into_response();
    if let Ok(value) = HeaderValue::from_str(&www_auth) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}
