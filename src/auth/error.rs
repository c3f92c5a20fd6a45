use axum::http::StatusCode;
use thiserror::Error;

/// Everything that can go wrong between "user clicked login" and "request is allowed".
///
/// Browser-facing flows turn these into `redirect_code()`s, JSON endpoints into
/// `code()` + `status()`. Neither path ever shows the `Display` text of an
/// `Internal` error to the client.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("oauth state missing, mismatched or expired")]
    InvalidState,

    #[error("authorization code missing from callback")]
    MissingCode,

    #[error("authorization code expired or already used")]
    CodeExpiredOrReused,

    #[error("failed to exchange authorization code: {0}")]
    TokenExchangeFailed(String),

    #[error("failed to fetch identity claims: {0}")]
    ClaimsFetchFailed(String),

    #[error("invalid or expired refresh token")]
    InvalidRefreshToken,

    #[error("no refresh token provided")]
    NoRefreshToken,

    #[error("user not found")]
    UserNotFound,

    #[error("user account is not active")]
    UserInactive,

    #[error("user is blacklisted")]
    UserBlacklisted,

    #[error("invalid access token")]
    InvalidAccessToken,

    #[error("missing required permissions")]
    Forbidden,

    #[error("unsupported identity provider: {0}")]
    UnsupportedProvider(String),

    #[error("no stored provider tokens for user")]
    ProviderTokenMissing,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Machine-readable code for JSON error envelopes
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidState => "INVALID_STATE",
            AuthError::MissingCode => "MISSING_CODE",
            AuthError::CodeExpiredOrReused => "CODE_EXPIRED_OR_REUSED",
            AuthError::TokenExchangeFailed(_) => "TOKEN_EXCHANGE_FAILED",
            AuthError::ClaimsFetchFailed(_) => "CLAIMS_FETCH_FAILED",
            AuthError::InvalidRefreshToken => "INVALID_REFRESH_TOKEN",
            AuthError::NoRefreshToken => "NO_REFRESH_TOKEN",
            AuthError::UserNotFound => "USER_NOT_FOUND",
            AuthError::UserInactive => "USER_INACTIVE",
            AuthError::UserBlacklisted => "USER_BLACKLISTED",
            AuthError::InvalidAccessToken => "INVALID_ACCESS_TOKEN",
            AuthError::Forbidden => "FORBIDDEN",
            AuthError::UnsupportedProvider(_) => "UNSUPPORTED_PROVIDER",
            AuthError::ProviderTokenMissing => "PROVIDER_TOKEN_MISSING",
            AuthError::Configuration(_) => "CONFIGURATION_ERROR",
            AuthError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Short code appended to `/login?error=` when a browser flow fails
    pub fn redirect_code(&self) -> &'static str {
        match self {
            AuthError::InvalidState => "invalid_state",
            AuthError::MissingCode => "missing_code",
            AuthError::CodeExpiredOrReused => "invalid_code",
            AuthError::TokenExchangeFailed(_) | AuthError::ClaimsFetchFailed(_) => {
                "token_exchange_failed"
            }
            AuthError::UnsupportedProvider(_) => "unsupported_provider",
            AuthError::UserInactive | AuthError::UserBlacklisted => "account_inactive",
            _ => "auth_failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::UnsupportedProvider(_) | AuthError::MissingCode => StatusCode::BAD_REQUEST,
            AuthError::Configuration(_) | AuthError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Message that is safe to hand to a client
    pub fn public_message(&self) -> String {
        match self {
            AuthError::Internal(_) | AuthError::Configuration(_) => {
                "Internal server error".to_string()
            }
            AuthError::TokenExchangeFailed(_) => "Failed to exchange code for tokens".to_string(),
            AuthError::ClaimsFetchFailed(_) => "Failed to get user info".to_string(),
            other => capitalise(&other.to_string()),
        }
    }
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
