mod auth;

use anyhow::{Context, Result};
use auth::{
    AuthAppState, AuthConfig, CookieSettings, InMemoryStateStore, InMemoryUserRepository,
    ProviderConfig, RedisStateStore, SessionService, StateStore, parse_duration,
};
use axum::http::{HeaderValue, Method, header};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gitcode-auth")]
#[command(about = "gitcode auth service: keycloak login, refresh cookies and access tokens")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind to
    #[arg(short, long, env = "PORT", default_value = "4001")]
    port: u16,

    /// Browser-facing keycloak base URL
    #[arg(long, env = "KEYCLOAK_URL")]
    keycloak_url: String,

    /// Back-channel keycloak base URL for token/userinfo calls (defaults to KEYCLOAK_URL)
    #[arg(long, env = "KEYCLOAK_INTERNAL_URL")]
    keycloak_internal_url: Option<String>,

    #[arg(long, env = "KEYCLOAK_REALM")]
    keycloak_realm: String,

    #[arg(long, env = "KEYCLOAK_CLIENT_ID")]
    keycloak_client_id: String,

    #[arg(long, env = "KEYCLOAK_CLIENT_SECRET")]
    keycloak_client_secret: String,

    /// HMAC secret for access tokens
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Access token lifetime (e.g. 900, 15m, 1h)
    #[arg(long, env = "JWT_ACCESS_EXPIRES_IN", default_value = "15m")]
    jwt_access_expires_in: String,

    /// Refresh token lifetime, also how long a ban blacklist entry lives
    #[arg(long, env = "JWT_REFRESH_EXPIRES_IN", default_value = "7d")]
    jwt_refresh_expires_in: String,

    /// Where browser flows end up
    #[arg(long, env = "FRONTEND_URL", default_value = "http://localhost:3000")]
    frontend_url: String,

    /// OAuth redirect URI registered with keycloak
    #[arg(
        long,
        env = "API_CALLBACK_URL",
        default_value = "http://localhost:4001/auth/callback"
    )]
    callback_url: String,

    /// Where keycloak's account page sends the user back to
    #[arg(
        long,
        env = "API_CALLBACK_ACCOUNT_URL",
        default_value = "http://localhost:4001/auth/account/callback"
    )]
    account_callback_url: String,

    /// Redis for the state store. Without it everything lives in memory (single instance only)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Set the Secure attribute on cookies (turn on behind https)
    #[arg(long, env = "COOKIE_SECURE", default_value = "false")]
    cookie_secure: bool,

    /// Timeout for calls to keycloak, in seconds
    #[arg(long, env = "PROVIDER_TIMEOUT_SECS", default_value = "5")]
    provider_timeout: u64,
}

impl Args {
    fn auth_config(&self) -> Result<AuthConfig> {
        let jwt_secret = self
            .jwt_secret
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| auth::AuthError::Configuration("JWT_SECRET must be set".to_string()))?;

        let config = AuthConfig {
            provider: ProviderConfig {
                base_url: self.keycloak_url.clone(),
                internal_url: self
                    .keycloak_internal_url
                    .clone()
                    .unwrap_or_else(|| self.keycloak_url.clone()),
                realm: self.keycloak_realm.clone(),
                client_id: self.keycloak_client_id.clone(),
                client_secret: self.keycloak_client_secret.clone(),
                redirect_uri: self.callback_url.clone(),
                account_redirect_uri: self.account_callback_url.clone(),
            },
            jwt_secret,
            access_token_ttl: parse_duration(&self.jwt_access_expires_in)?,
            refresh_token_ttl: parse_duration(&self.jwt_refresh_expires_in)?,
            frontend_url: self.frontend_url.clone(),
            cookie_secure: self.cookie_secure,
            provider_timeout: Duration::from_secs(self.provider_timeout),
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gitcode_auth=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.auth_config()?;
    let shutdown = CancellationToken::new();

    let store: Arc<dyn StateStore + Send + Sync> = match &args.redis_url {
        Some(url) => {
            let store = RedisStateStore::connect(url).await?;
            tracing::info!("State store: redis");
            Arc::new(store)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory state store (single instance only)");
            let store = InMemoryStateStore::new();
            spawn_store_sweeper(store.clone(), shutdown.clone());
            Arc::new(store)
        }
    };

    // users live in-process here; anything implementing UserRepository slots in
    let users = Arc::new(InMemoryUserRepository::new());

    let sessions = SessionService::new(&config, store, users)?;
    let state = AuthAppState {
        sessions: Arc::new(sessions),
        cookies: CookieSettings {
            secure: config.cookie_secure,
        },
        frontend_url: config.frontend_url.clone(),
    };

    run_server(&args.host, args.port, state, &config.frontend_url, shutdown).await
}

/// The in-memory store only drops expired entries lazily; this keeps it from growing
fn spawn_store_sweeper(store: InMemoryStateStore, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    store.purge_expired().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

async fn run_server(
    host: &str,
    port: u16,
    state: AuthAppState,
    frontend_url: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    // we pass this to TcpListener::bind() which accepts ToSocketAddrs,
    // so hostnames like "localhost" get resolved properly (unlike SocketAddr::parse)
    let bind_addr = format!("{}:{}", host, port);

    // Rate limiting: 10 requests per second per IP, burst of 30
    // SmartIpKeyExtractor checks x-forwarded-for and friends before falling back to peer ip,
    // so this works both behind a proxy and when running locally
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(10)
            .burst_size(30)
            .finish()
            .context("Failed to build rate limiter config")?,
    );
    let governor_limiter = governor_conf.limiter().clone();

    tokio::spawn({
        let limiter = governor_limiter;
        let shutdown = shutdown.clone();
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => limiter.retain_recent(),
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    });

    // cookies only travel cross-origin with credentials, so the origin has to be exact
    let origin = HeaderValue::from_str(frontend_url.trim_end_matches('/'))
        .context("FRONTEND_URL is not a valid origin")?;
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::exact(origin))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let app = auth::router(state)
        .layer(GovernorLayer::new(governor_conf))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Auth service listening on {}", bind_addr);
    tracing::info!("Login endpoint: http://{}/auth/login", bind_addr);

    // into_make_service_with_connect_info gives us the peer ip for rate limiting fallback
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
    }
    tracing::info!("Shutting down");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "gitcode-auth",
            "--keycloak-url",
            "http://localhost:8080",
            "--keycloak-realm",
            "gitcode",
            "--keycloak-client-id",
            "gitcode-web",
            "--keycloak-client-secret",
            "kc-secret",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_missing_jwt_secret_is_a_configuration_error() {
        let err = args(&[]).auth_config().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<auth::AuthError>(),
            Some(auth::AuthError::Configuration(_))
        ));

        let err = args(&["--jwt-secret", "   "]).auth_config().unwrap_err();
        assert!(err.downcast_ref::<auth::AuthError>().is_some());
    }

    #[test]
    fn test_defaults() {
        let config = args(&["--jwt-secret", "s3cret"]).auth_config().unwrap();
        assert_eq!(config.access_token_ttl, Duration::from_secs(15 * 60));
        assert_eq!(config.refresh_token_ttl, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(config.provider.internal_url, "http://localhost:8080");
        assert_eq!(
            config.provider.redirect_uri,
            "http://localhost:4001/auth/callback"
        );
        assert_eq!(config.frontend_url, "http://localhost:3000");
        assert!(!config.cookie_secure);
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        let err = args(&["--jwt-secret", "s", "--jwt-access-expires-in", "soon"])
            .auth_config()
            .unwrap_err();
        assert!(err.downcast_ref::<auth::AuthError>().is_some());
    }
}
