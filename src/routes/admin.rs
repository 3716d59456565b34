//! Minimal admin CRUD surface, gated by `admin_auth_middleware` in
//! `main.rs`. Only what's needed to operate the relay end-to-end: create
//! and list accounts, patch their health fields, issue and revoke API
//! keys. No session cookies, no OpenAPI surface — the admin HTTP design
//! is a collaborator this crate stands in for, not a subject here.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::AppState;
use crate::clock::now_millis;
use crate::crypto::fingerprint_key;
use crate::domain::{Account, AccountStatus, AccountType, ApiKey, ExpirationMode, KeyScope, Platform, ProxyConfig};
use crate::store::AccountPatch;

#[derive(Deserialize)]
pub struct CreateAccountRequest {
    pub platform: Platform,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub api_url: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    pub api_key: String,
    pub priority: u8,
    pub account_type: AccountType,
    #[serde(default)]
    pub supported_models: HashMap<String, String>,
}

pub async fn create_account(State(state): State<Arc<AppState>>, Json(req): Json<CreateAccountRequest>) -> Response {
    let account = Account {
        id: Uuid::new_v4().to_string(),
        platform: req.platform,
        name: req.name,
        description: req.description,
        api_url: req.api_url,
        user_agent: req.user_agent,
        proxy: req.proxy,
        api_key: req.api_key,
        priority: req.priority,
        schedulable: true,
        account_type: req.account_type,
        supported_models: req.supported_models,
        is_active: true,
        status: AccountStatus::Active,
        error_message: None,
        rate_limited_at: None,
        rate_limit_duration_minutes: None,
        daily_quota: 0,
        daily_usage: 0,
        quota_reset_time: None,
        quota_stopped_at: None,
        last_used_at: None,
    };

    if let Err(msg) = account.validate() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response();
    }

    match state.accounts.upsert(account.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "id": account.id }))).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Redacted view returned by the list endpoint — never echoes `api_key`.
#[derive(Serialize)]
pub struct AccountSummary {
    pub id: String,
    pub platform: Platform,
    pub name: String,
    pub priority: u8,
    pub schedulable: bool,
    pub account_type: AccountType,
    pub is_active: bool,
    pub status: AccountStatus,
    pub daily_quota: u64,
    pub daily_usage: u64,
    pub last_used_at: Option<i64>,
}

impl From<&Account> for AccountSummary {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id.clone(),
            platform: a.platform,
            name: a.name.clone(),
            priority: a.priority,
            schedulable: a.schedulable,
            account_type: a.account_type,
            is_active: a.is_active,
            status: a.status,
            daily_quota: a.daily_quota,
            daily_usage: a.daily_usage,
            last_used_at: a.last_used_at,
        }
    }
}

#[derive(Deserialize)]
pub struct ListAccountsQuery {
    pub platform: Platform,
}

pub async fn list_accounts(State(state): State<Arc<AppState>>, Query(q): Query<ListAccountsQuery>) -> Response {
    match state.accounts.find_all(q.platform).await {
        Ok(accounts) => Json(accounts.iter().map(AccountSummary::from).collect::<Vec<_>>()).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Deserialize, Default)]
pub struct UpdateAccountRequest {
    #[serde(default)]
    pub status: Option<AccountStatus>,
    #[serde(default)]
    pub error_message: Option<Option<String>>,
    #[serde(default)]
    pub daily_usage: Option<u64>,
}

pub async fn update_account(
    State(state): State<Arc<AppState>>,
    Path((platform, id)): Path<(Platform, String)>,
    Json(req): Json<UpdateAccountRequest>,
) -> Response {
    let patch = AccountPatch {
        status: req.status,
        error_message: req.error_message,
        rate_limited_at: None,
        last_used_at: Some(now_millis()),
        daily_usage: req.daily_usage,
    };
    match state.accounts.update(platform, &id, patch).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub cleartext_key: String,
    #[serde(default = "default_scope")]
    pub scope: KeyScope,
    #[serde(default)]
    pub console_account_id: Option<String>,
    #[serde(default)]
    pub codex_account_id: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<u64>,
    #[serde(default)]
    pub cost_limit: Option<f64>,
}

fn default_scope() -> KeyScope {
    KeyScope::All
}

pub async fn create_key(State(state): State<Arc<AppState>>, Json(req): Json<CreateKeyRequest>) -> Response {
    let fingerprint = fingerprint_key(&req.cleartext_key, &state.process_secret);
    let key = ApiKey {
        id: Uuid::new_v4().to_string(),
        fingerprint,
        name: req.name,
        scope: req.scope,
        console_account_id: req.console_account_id,
        codex_account_id: req.codex_account_id,
        is_deleted: false,
        is_active: true,
        deleted_at: None,
        expiration_mode: ExpirationMode::Fixed,
        activated_at: None,
        activation_duration_seconds: None,
        expires_at: None,
        rate_limit: req.rate_limit,
        cost_limit: req.cost_limit,
        created_at: now_millis(),
    };

    match state.api_keys.upsert(key.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "id": key.id }))).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn revoke_key(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.api_keys.soft_delete(&id, now_millis()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}
