use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::ServiceExt;
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use base64::Engine;
use clap::Parser;
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_core::auth::KeyAuthenticator;
use relay_core::balancer::LoadBalancer;
use relay_core::clock::TzClock;
use relay_core::config::{Config, CorsMode};
use relay_core::crypto::SecretCipher;
use relay_core::orchestrator::Orchestrator;
use relay_core::relay::Relayer;
use relay_core::scheduler::Scheduler;
use relay_core::store::{self, ApiKeysRepo};
use relay_core::store::sqlite::{SqliteAccountsRepo, SqliteApiKeysRepo, SqliteHeadersCacheRepo, SqliteSessionsRepo, SqliteUsageRepo};
use relay_core::usage_meter::UsageMeter;
use relay_core::{AppState, BUILD_TIME, GIT_HASH, VERSION, headers_cache, proxy, routes};

#[derive(Parser)]
#[command(name = "relay-core")]
#[command(about = "Multi-tenant API relay for Claude Code and Codex CLI clients")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "RELAY_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "RELAY_PORT")]
    port: Option<u16>,
}

async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if state.disable_auth {
        return next.run(request).await;
    }

    let (username, password) = &state.admin_credentials;

    let auth_header = request.headers().get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let Some(auth_value) = auth_header else {
        return unauthorized_response();
    };
    let Some(encoded) = auth_value.strip_prefix("Basic ") else {
        return unauthorized_response();
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return unauthorized_response();
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return unauthorized_response();
    };
    let Some((provided_user, provided_pass)) = credentials.split_once(':') else {
        return unauthorized_response();
    };

    let user_match = provided_user.as_bytes().ct_eq(username.as_bytes());
    let pass_match = provided_pass.as_bytes().ct_eq(password.as_bytes());

    if bool::from(user_match) && bool::from(pass_match) {
        next.run(request).await
    } else {
        unauthorized_response()
    }
}

fn unauthorized_response() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let db = store::sqlite::init_db(&config.db_path())
        .await
        .expect("failed to initialize database");

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    let cipher = Arc::new(SecretCipher::derive(&config.process_secret));
    let accounts_repo = Arc::new(SqliteAccountsRepo::new(db.clone(), cipher));
    let sessions_repo = Arc::new(SqliteSessionsRepo::new(db.clone()));
    let usage_repo = Arc::new(SqliteUsageRepo::new(db.clone()));
    let headers_repo = Arc::new(SqliteHeadersCacheRepo::new(db.clone()));
    let api_keys_repo: Arc<dyn ApiKeysRepo> = Arc::new(SqliteApiKeysRepo::new(db.clone()));

    let balancer = Arc::new(LoadBalancer::new());
    let scheduler = Arc::new(Scheduler::new(
        accounts_repo.clone(),
        sessions_repo,
        balancer,
        config.session_ttl_days,
        config.session_renewal_threshold_days,
        config.max_retries,
    ));

    let proxy_factory = Arc::new(proxy::ProxyAgentFactory::new(Duration::from_secs(config.upstream_timeout_secs)));
    let headers_cache = Arc::new(headers_cache::HeadersCache::new(headers_repo));
    let relayer = Arc::new(Relayer::new(
        proxy_factory,
        headers_cache.clone(),
        accounts_repo.clone(),
        Duration::from_secs(config.upstream_timeout_secs),
        config.proxy_use_ipv4_default,
    ));
    let usage_meter = Arc::new(UsageMeter::new(usage_repo, TzClock::new(config.tz_offset_hours)));
    let key_auth = Arc::new(KeyAuthenticator::new(api_keys_repo.clone(), config.process_secret.clone()));
    let orchestrator = Arc::new(Orchestrator::new(scheduler, relayer, headers_cache, usage_meter));

    let disable_auth = config.disable_auth;
    if disable_auth {
        tracing::warn!("Admin authentication is DISABLED (RELAY_DISABLE_ADMIN_AUTH=1)");
    }

    let state = Arc::new(AppState {
        accounts: accounts_repo,
        api_keys: api_keys_repo,
        orchestrator,
        key_auth,
        admin_credentials: (config.admin_username.clone(), config.admin_password.clone()),
        disable_auth,
        process_secret: config.process_secret.clone(),
    });

    let cors_origins = config.cors_mode.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };

            match &cors_origins {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(url.host_str(), Some("localhost") | Some("127.0.0.1") | Some("::1"))
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("anthropic-version"),
        ])
        .allow_credentials(true);

    match &config.cors_mode {
        CorsMode::AllowAll => info!("CORS: allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: localhost only"),
        CorsMode::AllowList(list) => info!("CORS: allowing origins: {list:?}"),
    }

    let admin_routes = Router::new()
        .route("/accounts", post(routes::admin::create_account).get(routes::admin::list_accounts))
        .route("/accounts/{platform}/{id}", patch(routes::admin::update_account))
        .route("/keys", post(routes::admin::create_key))
        .route("/keys/{id}", delete(routes::admin::revoke_key))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    let api_routes = Router::new().route("/messages", post(routes::messages::post_messages));

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/health", get(routes::health::health))
            .route("/version", get(routes::health::version))
            .nest("/admin", admin_routes)
            .nest("/api/v1", api_routes)
            .layer(cors)
            .with_state(state),
    );

    let addr: SocketAddr = format!("{host}:{port}").parse().expect("invalid address");
    info!("Starting relay-core v{VERSION}-{GIT_HASH} (built {BUILD_TIME})");
    info!("Listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, ServiceExt::<axum::extract::Request>::into_make_service(app))
        .await
        .unwrap();
}
