//! Library root: re-exports every module so both the `relay-core` binary
//! and the integration tests under `tests/` link against one crate.

pub mod auth;
pub mod balancer;
pub mod clock;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod fingerprint;
pub mod headers_cache;
pub mod orchestrator;
pub mod proxy;
pub mod relay;
pub mod routes;
pub mod scheduler;
pub mod sse;
pub mod store;
pub mod usage_meter;
pub mod validator;

use std::sync::Arc;

use auth::KeyAuthenticator;
use orchestrator::Orchestrator;
use store::ApiKeysRepo;
use store::sqlite::SqliteAccountsRepo;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

/// Everything a route handler needs: the request orchestrator, the inbound
/// key authenticator, and the account/key repositories the admin surface
/// operates on directly (the orchestrator itself never creates or deletes
/// records).
pub struct AppState {
    pub accounts: Arc<SqliteAccountsRepo>,
    pub api_keys: Arc<dyn ApiKeysRepo>,
    pub orchestrator: Arc<Orchestrator>,
    pub key_auth: Arc<KeyAuthenticator>,
    pub admin_credentials: (String, String),
    pub disable_auth: bool,
    pub process_secret: String,
}
