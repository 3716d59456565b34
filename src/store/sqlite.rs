//! turso-backed repository implementations: the production backing store.
//!
//! A single ordered `MIGRATIONS` list, a `schema_version` table, and
//! per-connection `PRAGMA foreign_keys = ON` build out the five tables
//! this crate's domain model needs. Account secrets are encrypted at
//! rest via [`crate::crypto::SecretCipher`] and decrypted only on read.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use turso::{Builder, Connection, Database, Row};

use crate::constants::{USAGE_DAY_RETENTION_DAYS, USAGE_HOUR_RETENTION_DAYS, USAGE_MONTH_RETENTION_DAYS};
use crate::crypto::SecretCipher;
use crate::domain::{
    Account, AccountStatus, AccountType, ApiKey, ExpirationMode, KeyScope, Platform, ProxyConfig,
    Usage, UsageCounters,
};
use crate::error::RelayError;

use super::{AccountPatch, AccountsRepo, ApiKeysRepo, HeadersCacheRepo, HeadersSnapshot, SessionBinding, SessionsRepo, UsageRepo};

fn db_err(context: &str, e: impl std::fmt::Display) -> RelayError {
    RelayError::Repository(format!("{context}: {e}"))
}

const DAY_MILLIS: i64 = 86_400_000;

// ---------------------------------------------------------------------------
// Migration framework
// ---------------------------------------------------------------------------

type MigrationFn = fn(&Connection) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + '_>>;

struct Migration {
    version: i64,
    description: &'static str,
    migrate: MigrationFn,
}

static MIGRATIONS: &[Migration] =
    &[Migration { version: 1, description: "initial schema: accounts, sessions, api_keys, usage_counters, headers_cache", migrate: migrate_v1 }];

async fn get_schema_version(conn: &Connection) -> Result<i64, RelayError> {
    let mut rows = conn
        .query("SELECT version FROM schema_version LIMIT 1", ())
        .await
        .map_err(|e| db_err("read schema version", e))?;
    let version = rows.next().await.ok().flatten().and_then(|r| r.get::<i64>(0).ok()).unwrap_or(0);
    Ok(version)
}

async fn set_schema_version(conn: &Connection, version: i64) -> Result<(), RelayError> {
    conn.execute("DELETE FROM schema_version", ()).await.map_err(|e| db_err("clear schema version", e))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", (version,))
        .await
        .map_err(|e| db_err("set schema version", e))?;
    Ok(())
}

async fn run_migrations(conn: &Connection) -> Result<(), RelayError> {
    conn.execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)", ())
        .await
        .map_err(|e| db_err("create schema_version table", e))?;

    let mut current = get_schema_version(conn).await?;
    for migration in MIGRATIONS {
        if migration.version > current {
            info!("running migration v{}: {}", migration.version, migration.description);
            (migration.migrate)(conn).await?;
            set_schema_version(conn, migration.version).await?;
            current = migration.version;
        }
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + '_>> {
    Box::pin(async move {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT NOT NULL,
                platform TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                api_url TEXT NOT NULL,
                user_agent TEXT,
                proxy_json TEXT,
                api_key_encrypted TEXT NOT NULL,
                priority INTEGER NOT NULL,
                schedulable INTEGER NOT NULL,
                account_type TEXT NOT NULL,
                supported_models_json TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                rate_limited_at INTEGER,
                rate_limit_duration_minutes INTEGER,
                daily_quota INTEGER NOT NULL,
                daily_usage INTEGER NOT NULL,
                quota_reset_time TEXT,
                quota_stopped_at INTEGER,
                last_used_at INTEGER,
                PRIMARY KEY (platform, id)
            )
            "#,
            (),
        )
        .await
        .map_err(|e| db_err("create accounts table", e))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                fingerprint TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| db_err("create sessions table", e))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                scope TEXT NOT NULL,
                console_account_id TEXT,
                codex_account_id TEXT,
                is_deleted INTEGER NOT NULL,
                is_active INTEGER NOT NULL,
                deleted_at INTEGER,
                expiration_mode TEXT NOT NULL,
                activated_at INTEGER,
                activation_duration_seconds INTEGER,
                expires_at INTEGER,
                rate_limit INTEGER,
                cost_limit REAL,
                created_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| db_err("create api_keys table", e))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS usage_counters (
                key_id TEXT NOT NULL,
                bucket TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cache_create_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens INTEGER NOT NULL DEFAULT 0,
                requests INTEGER NOT NULL DEFAULT 0,
                ephemeral_5m_tokens INTEGER NOT NULL DEFAULT 0,
                ephemeral_1h_tokens INTEGER NOT NULL DEFAULT 0,
                long_context_input_tokens INTEGER NOT NULL DEFAULT 0,
                long_context_output_tokens INTEGER NOT NULL DEFAULT 0,
                long_context_requests_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                expires_at INTEGER,
                PRIMARY KEY (key_id, bucket)
            )
            "#,
            (),
        )
        .await
        .map_err(|e| db_err("create usage_counters table", e))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS headers_cache (
                account_id TEXT PRIMARY KEY,
                headers_json TEXT NOT NULL,
                semver_major INTEGER NOT NULL,
                semver_minor INTEGER NOT NULL,
                semver_patch INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| db_err("create headers_cache table", e))?;

        Ok(())
    })
}

/// Open (creating if absent) the database at `path` and run pending
/// migrations, returning a live handle repositories can connect from.
pub async fn init_db(path: &Path) -> Result<Arc<Database>, RelayError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| db_err("create data directory", e))?;
    }

    let path_str = path.to_str().unwrap_or("relay.db");
    let db = Builder::new_local(path_str).build().await.map_err(|e| db_err("open database", e))?;
    let conn = db.connect().map_err(|e| db_err("connect", e))?;
    conn.execute("PRAGMA foreign_keys = ON", ()).await.map_err(|e| db_err("enable foreign keys", e))?;
    run_migrations(&conn).await?;

    info!("database initialized at {path_str}");
    Ok(Arc::new(db))
}

fn connect(db: &Database) -> Result<Connection, RelayError> {
    db.connect().map_err(|e| db_err("connect", e))
}

// ---------------------------------------------------------------------------
// Enum <-> TEXT codecs
// ---------------------------------------------------------------------------

fn platform_to_str(p: Platform) -> &'static str {
    p.as_str()
}

fn platform_from_str(s: &str) -> Platform {
    match s {
        "codex" => Platform::Codex,
        _ => Platform::Console,
    }
}

fn account_type_to_str(t: AccountType) -> &'static str {
    match t {
        AccountType::Dedicated => "dedicated",
        AccountType::Shared => "shared",
    }
}

fn account_type_from_str(s: &str) -> AccountType {
    match s {
        "dedicated" => AccountType::Dedicated,
        _ => AccountType::Shared,
    }
}

fn status_to_str(s: AccountStatus) -> &'static str {
    match s {
        AccountStatus::Active => "active",
        AccountStatus::Error => "error",
        AccountStatus::RateLimited => "rate_limited",
        AccountStatus::Unauthorized => "unauthorized",
        AccountStatus::Overloaded => "overloaded",
        AccountStatus::Blocked => "blocked",
        AccountStatus::QuotaExceeded => "quota_exceeded",
        AccountStatus::TempError => "temp_error",
    }
}

fn status_from_str(s: &str) -> AccountStatus {
    match s {
        "error" => AccountStatus::Error,
        "rate_limited" => AccountStatus::RateLimited,
        "unauthorized" => AccountStatus::Unauthorized,
        "overloaded" => AccountStatus::Overloaded,
        "blocked" => AccountStatus::Blocked,
        "quota_exceeded" => AccountStatus::QuotaExceeded,
        "temp_error" => AccountStatus::TempError,
        _ => AccountStatus::Active,
    }
}

fn scope_to_str(s: KeyScope) -> &'static str {
    match s {
        KeyScope::All => "all",
        KeyScope::Console => "console",
        KeyScope::Codex => "codex",
    }
}

fn scope_from_str(s: &str) -> KeyScope {
    match s {
        "console" => KeyScope::Console,
        "codex" => KeyScope::Codex,
        _ => KeyScope::All,
    }
}

fn expiration_mode_to_str(m: ExpirationMode) -> &'static str {
    match m {
        ExpirationMode::Fixed => "fixed",
        ExpirationMode::Activation => "activation",
    }
}

fn expiration_mode_from_str(s: &str) -> ExpirationMode {
    match s {
        "activation" => ExpirationMode::Activation,
        _ => ExpirationMode::Fixed,
    }
}

fn proxy_to_json(proxy: &Option<ProxyConfig>) -> Option<String> {
    proxy.as_ref().map(|p| serde_json::to_string(p).expect("ProxyConfig serializes"))
}

fn proxy_from_json(raw: Option<String>) -> Option<ProxyConfig> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

// ---------------------------------------------------------------------------
// Row -> domain mapping
// ---------------------------------------------------------------------------

fn account_from_row(row: &Row) -> Result<Account, RelayError> {
    let proxy_raw: Option<String> = row.get(6).map_err(|e| db_err("read proxy_json", e))?;
    let supported_models_json: String =
        row.get(11).map_err(|e| db_err("read supported_models_json", e))?;
    let supported_models: HashMap<String, String> =
        serde_json::from_str(&supported_models_json).unwrap_or_default();

    Ok(Account {
        id: row.get(0).map_err(|e| db_err("read id", e))?,
        platform: platform_from_str(&row.get::<String>(1).map_err(|e| db_err("read platform", e))?),
        name: row.get(2).map_err(|e| db_err("read name", e))?,
        description: row.get(3).map_err(|e| db_err("read description", e))?,
        api_url: row.get(4).map_err(|e| db_err("read api_url", e))?,
        user_agent: row.get(5).map_err(|e| db_err("read user_agent", e))?,
        proxy: proxy_from_json(proxy_raw),
        api_key: row.get(7).map_err(|e| db_err("read api_key_encrypted", e))?,
        priority: row.get::<i64>(8).map_err(|e| db_err("read priority", e))? as u8,
        schedulable: row.get::<i64>(9).map_err(|e| db_err("read schedulable", e))? != 0,
        account_type: account_type_from_str(&row.get::<String>(10).map_err(|e| db_err("read account_type", e))?),
        supported_models,
        is_active: row.get::<i64>(12).map_err(|e| db_err("read is_active", e))? != 0,
        status: status_from_str(&row.get::<String>(13).map_err(|e| db_err("read status", e))?),
        error_message: row.get(14).map_err(|e| db_err("read error_message", e))?,
        rate_limited_at: row.get(15).map_err(|e| db_err("read rate_limited_at", e))?,
        rate_limit_duration_minutes: row.get(16).map_err(|e| db_err("read rate_limit_duration_minutes", e))?,
        daily_quota: row.get::<i64>(17).map_err(|e| db_err("read daily_quota", e))? as u64,
        daily_usage: row.get::<i64>(18).map_err(|e| db_err("read daily_usage", e))? as u64,
        quota_reset_time: row.get(19).map_err(|e| db_err("read quota_reset_time", e))?,
        quota_stopped_at: row.get(20).map_err(|e| db_err("read quota_stopped_at", e))?,
        last_used_at: row.get(21).map_err(|e| db_err("read last_used_at", e))?,
    })
}

const ACCOUNT_COLUMNS: &str = "id, platform, name, description, api_url, user_agent, proxy_json, \
    api_key_encrypted, priority, schedulable, account_type, supported_models_json, is_active, \
    status, error_message, rate_limited_at, rate_limit_duration_minutes, daily_quota, \
    daily_usage, quota_reset_time, quota_stopped_at, last_used_at";

/// Decrypts `api_key` in place. Rows are stored with the cipher's output;
/// callers of this repository expect cleartext (see [`crate::domain::Account`]).
fn decrypt_account(mut account: Account, cipher: &SecretCipher) -> Result<Account, RelayError> {
    account.api_key = cipher.decrypt(&account.api_key)?;
    Ok(account)
}

// ---------------------------------------------------------------------------
// AccountsRepo
// ---------------------------------------------------------------------------

pub struct SqliteAccountsRepo {
    db: Arc<Database>,
    cipher: Arc<SecretCipher>,
}

impl SqliteAccountsRepo {
    pub fn new(db: Arc<Database>, cipher: Arc<SecretCipher>) -> Self {
        Self { db, cipher }
    }
}

#[async_trait]
impl AccountsRepo for SqliteAccountsRepo {
    async fn find_by_id(&self, platform: Platform, id: &str) -> Result<Option<Account>, RelayError> {
        let conn = connect(&self.db)?;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE platform = ? AND id = ?");
        let mut rows = conn
            .query(&sql, (platform_to_str(platform), id))
            .await
            .map_err(|e| db_err("query account", e))?;
        let Some(row) = rows.next().await.map_err(|e| db_err("fetch account row", e))? else {
            return Ok(None);
        };
        Ok(Some(decrypt_account(account_from_row(&row)?, &self.cipher)?))
    }

    async fn find_all(&self, platform: Platform) -> Result<Vec<Account>, RelayError> {
        let conn = connect(&self.db)?;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE platform = ?");
        let mut rows =
            conn.query(&sql, (platform_to_str(platform),)).await.map_err(|e| db_err("query accounts", e))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| db_err("fetch account row", e))? {
            out.push(decrypt_account(account_from_row(&row)?, &self.cipher)?);
        }
        Ok(out)
    }

    async fn update(&self, platform: Platform, id: &str, patch: AccountPatch) -> Result<(), RelayError> {
        let conn = connect(&self.db)?;
        if let Some(status) = patch.status {
            conn.execute(
                "UPDATE accounts SET status = ? WHERE platform = ? AND id = ?",
                (status_to_str(status), platform_to_str(platform), id),
            )
            .await
            .map_err(|e| db_err("update account status", e))?;
        }
        if let Some(error_message) = patch.error_message {
            conn.execute(
                "UPDATE accounts SET error_message = ? WHERE platform = ? AND id = ?",
                (error_message, platform_to_str(platform), id),
            )
            .await
            .map_err(|e| db_err("update account error_message", e))?;
        }
        if let Some(rate_limited_at) = patch.rate_limited_at {
            conn.execute(
                "UPDATE accounts SET rate_limited_at = ? WHERE platform = ? AND id = ?",
                (rate_limited_at, platform_to_str(platform), id),
            )
            .await
            .map_err(|e| db_err("update account rate_limited_at", e))?;
        }
        if let Some(last_used_at) = patch.last_used_at {
            conn.execute(
                "UPDATE accounts SET last_used_at = ? WHERE platform = ? AND id = ?",
                (last_used_at, platform_to_str(platform), id),
            )
            .await
            .map_err(|e| db_err("update account last_used_at", e))?;
        }
        if let Some(daily_usage) = patch.daily_usage {
            conn.execute(
                "UPDATE accounts SET daily_usage = ? WHERE platform = ? AND id = ?",
                (daily_usage as i64, platform_to_str(platform), id),
            )
            .await
            .map_err(|e| db_err("update account daily_usage", e))?;
        }
        Ok(())
    }
}

impl SqliteAccountsRepo {
    /// Insert or replace an account, encrypting `api_key` with the process
    /// cipher before it ever reaches disk. Used by the admin surface.
    pub async fn upsert(&self, mut account: Account) -> Result<(), RelayError> {
        account.api_key = self.cipher.encrypt(&account.api_key);
        let conn = connect(&self.db)?;
        let supported_models_json =
            serde_json::to_string(&account.supported_models).expect("supported_models serializes");
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO accounts ({ACCOUNT_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"
            ),
            (
                account.id.clone(),
                platform_to_str(account.platform).to_string(),
                account.name.clone(),
                account.description.clone(),
                account.api_url.clone(),
                account.user_agent.clone(),
                proxy_to_json(&account.proxy),
                account.api_key.clone(),
                account.priority as i64,
                account.schedulable as i64,
                account_type_to_str(account.account_type).to_string(),
                supported_models_json,
                account.is_active as i64,
                status_to_str(account.status).to_string(),
                account.error_message.clone(),
                account.rate_limited_at,
                account.rate_limit_duration_minutes,
                account.daily_quota as i64,
                account.daily_usage as i64,
                account.quota_reset_time.clone(),
                account.quota_stopped_at,
                account.last_used_at,
            ),
        )
        .await
        .map_err(|e| db_err("upsert account", e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SessionsRepo
// ---------------------------------------------------------------------------

pub struct SqliteSessionsRepo {
    db: Arc<Database>,
}

impl SqliteSessionsRepo {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionsRepo for SqliteSessionsRepo {
    async fn get(&self, fingerprint: &str) -> Result<Option<SessionBinding>, RelayError> {
        let conn = connect(&self.db)?;
        let mut rows = conn
            .query("SELECT account_id, platform, expires_at FROM sessions WHERE fingerprint = ?", (fingerprint,))
            .await
            .map_err(|e| db_err("query session", e))?;
        let Some(row) = rows.next().await.map_err(|e| db_err("fetch session row", e))? else {
            return Ok(None);
        };
        let expires_at: i64 = row.get(2).map_err(|e| db_err("read expires_at", e))?;
        if expires_at <= crate::clock::now_millis() {
            return Ok(None);
        }
        Ok(Some(SessionBinding {
            account_id: row.get(0).map_err(|e| db_err("read account_id", e))?,
            platform: platform_from_str(&row.get::<String>(1).map_err(|e| db_err("read platform", e))?),
        }))
    }

    async fn set(&self, fingerprint: &str, binding: SessionBinding, ttl_days: i64) -> Result<(), RelayError> {
        let conn = connect(&self.db)?;
        let expires_at = crate::clock::now_millis() + ttl_days * DAY_MILLIS;
        conn.execute(
            "INSERT OR REPLACE INTO sessions (fingerprint, account_id, platform, expires_at) VALUES (?,?,?,?)",
            (fingerprint, binding.account_id, platform_to_str(binding.platform), expires_at),
        )
        .await
        .map_err(|e| db_err("upsert session", e))?;
        Ok(())
    }

    async fn extend_if_needed(
        &self,
        fingerprint: &str,
        ttl_days: i64,
        renewal_threshold_days: i64,
    ) -> Result<bool, RelayError> {
        let conn = connect(&self.db)?;
        let mut rows = conn
            .query("SELECT expires_at FROM sessions WHERE fingerprint = ?", (fingerprint,))
            .await
            .map_err(|e| db_err("query session expiry", e))?;
        let Some(row) = rows.next().await.map_err(|e| db_err("fetch session row", e))? else {
            return Ok(false);
        };
        let expires_at: i64 = row.get(0).map_err(|e| db_err("read expires_at", e))?;
        let now = crate::clock::now_millis();
        let remaining_days = (expires_at - now) / DAY_MILLIS;
        if remaining_days >= renewal_threshold_days {
            return Ok(false);
        }
        let new_expires_at = now + ttl_days * DAY_MILLIS;
        conn.execute(
            "UPDATE sessions SET expires_at = ? WHERE fingerprint = ?",
            (new_expires_at, fingerprint),
        )
        .await
        .map_err(|e| db_err("extend session", e))?;
        Ok(true)
    }

    async fn delete(&self, fingerprint: &str) -> Result<(), RelayError> {
        let conn = connect(&self.db)?;
        conn.execute("DELETE FROM sessions WHERE fingerprint = ?", (fingerprint,))
            .await
            .map_err(|e| db_err("delete session", e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// UsageRepo
// ---------------------------------------------------------------------------

pub struct SqliteUsageRepo {
    db: Arc<Database>,
}

impl SqliteUsageRepo {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// `retention_days = None` means no TTL (the lifetime bucket); `Some(d)`
    /// stamps `expires_at` on first insert only — re-incrementing an
    /// already-live bucket never pushes its expiry back out, since the
    /// bucket's calendar period (and thus its natural expiry) never changes.
    async fn bump(
        &self,
        conn: &Connection,
        key_id: &str,
        bucket: &str,
        usage: &Usage,
        long_context: bool,
        retention_days: Option<i64>,
    ) -> Result<(), RelayError> {
        let (lc_input, lc_output, lc_requests) = match (long_context, usage.long_context) {
            (true, Some(lc)) => (lc.input_tokens as i64, lc.output_tokens as i64, lc.requests as i64),
            _ => (0, 0, 0),
        };
        let expires_at = retention_days.map(|days| crate::clock::now_millis() + days * DAY_MILLIS);
        conn.execute(
            r#"
            INSERT INTO usage_counters (key_id, bucket, input_tokens, output_tokens, cache_create_tokens,
                cache_read_tokens, requests, ephemeral_5m_tokens, ephemeral_1h_tokens,
                long_context_input_tokens, long_context_output_tokens, long_context_requests_tokens, cost,
                expires_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (key_id, bucket) DO UPDATE SET
                input_tokens = input_tokens + excluded.input_tokens,
                output_tokens = output_tokens + excluded.output_tokens,
                cache_create_tokens = cache_create_tokens + excluded.cache_create_tokens,
                cache_read_tokens = cache_read_tokens + excluded.cache_read_tokens,
                requests = requests + 1,
                ephemeral_5m_tokens = ephemeral_5m_tokens + excluded.ephemeral_5m_tokens,
                ephemeral_1h_tokens = ephemeral_1h_tokens + excluded.ephemeral_1h_tokens,
                long_context_input_tokens = long_context_input_tokens + excluded.long_context_input_tokens,
                long_context_output_tokens = long_context_output_tokens + excluded.long_context_output_tokens,
                long_context_requests_tokens = long_context_requests_tokens + excluded.long_context_requests_tokens,
                cost = cost + excluded.cost
            "#,
            (
                key_id,
                bucket,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.cache_create_tokens as i64,
                usage.cache_read_tokens as i64,
                usage.ephemeral_5m_tokens.unwrap_or(0) as i64,
                usage.ephemeral_1h_tokens.unwrap_or(0) as i64,
                lc_input,
                lc_output,
                lc_requests,
                usage.cost.unwrap_or(0.0),
                expires_at,
            ),
        )
        .await
        .map_err(|e| db_err("bump usage counters", e))?;
        Ok(())
    }
}

#[async_trait]
impl UsageRepo for SqliteUsageRepo {
    async fn increment_usage(
        &self,
        key_id: &str,
        day: &str,
        month: &str,
        hour: &str,
        usage: Usage,
        long_context: bool,
    ) -> Result<(), RelayError> {
        let conn = connect(&self.db)?;
        self.bump(&conn, key_id, "lifetime", &usage, long_context, None).await?;
        self.bump(&conn, key_id, day, &usage, false, Some(USAGE_DAY_RETENTION_DAYS)).await?;
        self.bump(&conn, key_id, month, &usage, false, Some(USAGE_MONTH_RETENTION_DAYS)).await?;
        self.bump(&conn, key_id, hour, &usage, false, Some(USAGE_HOUR_RETENTION_DAYS)).await?;
        Ok(())
    }

    async fn get_counters(&self, key_id: &str, bucket: &str) -> Result<Option<UsageCounters>, RelayError> {
        let conn = connect(&self.db)?;
        let mut rows = conn
            .query(
                "SELECT input_tokens, output_tokens, cache_create_tokens, cache_read_tokens, requests, \
                 ephemeral_5m_tokens, ephemeral_1h_tokens, long_context_input_tokens, \
                 long_context_output_tokens, long_context_requests_tokens, cost, expires_at \
                 FROM usage_counters WHERE key_id = ? AND bucket = ?",
                (key_id, bucket),
            )
            .await
            .map_err(|e| db_err("query usage counters", e))?;
        let Some(row) = rows.next().await.map_err(|e| db_err("fetch usage row", e))? else {
            return Ok(None);
        };
        let expires_at: Option<i64> = row.get(11).map_err(|e| db_err("read expires_at", e))?;
        if expires_at.is_some_and(|exp| exp <= crate::clock::now_millis()) {
            return Ok(None);
        }
        Ok(Some(UsageCounters {
            input_tokens: row.get::<i64>(0).map_err(|e| db_err("read input_tokens", e))? as u64,
            output_tokens: row.get::<i64>(1).map_err(|e| db_err("read output_tokens", e))? as u64,
            cache_create_tokens: row.get::<i64>(2).map_err(|e| db_err("read cache_create_tokens", e))? as u64,
            cache_read_tokens: row.get::<i64>(3).map_err(|e| db_err("read cache_read_tokens", e))? as u64,
            requests: row.get::<i64>(4).map_err(|e| db_err("read requests", e))? as u64,
            ephemeral_5m_tokens: row.get::<i64>(5).map_err(|e| db_err("read ephemeral_5m_tokens", e))? as u64,
            ephemeral_1h_tokens: row.get::<i64>(6).map_err(|e| db_err("read ephemeral_1h_tokens", e))? as u64,
            long_context_input_tokens: row.get::<i64>(7).map_err(|e| db_err("read long_context_input_tokens", e))? as u64,
            long_context_output_tokens: row.get::<i64>(8).map_err(|e| db_err("read long_context_output_tokens", e))? as u64,
            long_context_requests_tokens: row.get::<i64>(9).map_err(|e| db_err("read long_context_requests_tokens", e))? as u64,
            cost: row.get(10).map_err(|e| db_err("read cost", e))?,
        }))
    }
}

// ---------------------------------------------------------------------------
// HeadersCacheRepo
// ---------------------------------------------------------------------------

pub struct SqliteHeadersCacheRepo {
    db: Arc<Database>,
}

impl SqliteHeadersCacheRepo {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl HeadersCacheRepo for SqliteHeadersCacheRepo {
    async fn get(&self, account_id: &str) -> Result<Option<HeadersSnapshot>, RelayError> {
        let conn = connect(&self.db)?;
        let mut rows = conn
            .query(
                "SELECT headers_json, semver_major, semver_minor, semver_patch, updated_at, expires_at \
                 FROM headers_cache WHERE account_id = ?",
                (account_id,),
            )
            .await
            .map_err(|e| db_err("query headers cache", e))?;
        let Some(row) = rows.next().await.map_err(|e| db_err("fetch headers cache row", e))? else {
            return Ok(None);
        };
        let expires_at: i64 = row.get(5).map_err(|e| db_err("read expires_at", e))?;
        if expires_at <= crate::clock::now_millis() {
            return Ok(None);
        }
        let headers_json: String = row.get(0).map_err(|e| db_err("read headers_json", e))?;
        let headers: HashMap<String, String> = serde_json::from_str(&headers_json).unwrap_or_default();
        Ok(Some(HeadersSnapshot {
            headers,
            semver: (
                row.get::<i64>(1).map_err(|e| db_err("read semver_major", e))? as u32,
                row.get::<i64>(2).map_err(|e| db_err("read semver_minor", e))? as u32,
                row.get::<i64>(3).map_err(|e| db_err("read semver_patch", e))? as u32,
            ),
            updated_at: row.get(4).map_err(|e| db_err("read updated_at", e))?,
        }))
    }

    async fn set(&self, account_id: &str, snapshot: HeadersSnapshot, ttl_days: i64) -> Result<(), RelayError> {
        let conn = connect(&self.db)?;
        let headers_json = serde_json::to_string(&snapshot.headers).expect("headers serialize");
        let expires_at = crate::clock::now_millis() + ttl_days * DAY_MILLIS;
        conn.execute(
            "INSERT OR REPLACE INTO headers_cache \
             (account_id, headers_json, semver_major, semver_minor, semver_patch, updated_at, expires_at) \
             VALUES (?,?,?,?,?,?,?)",
            (
                account_id,
                headers_json,
                snapshot.semver.0 as i64,
                snapshot.semver.1 as i64,
                snapshot.semver.2 as i64,
                snapshot.updated_at,
                expires_at,
            ),
        )
        .await
        .map_err(|e| db_err("upsert headers cache", e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ApiKeysRepo
// ---------------------------------------------------------------------------

pub struct SqliteApiKeysRepo {
    db: Arc<Database>,
}

impl SqliteApiKeysRepo {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

const API_KEY_COLUMNS: &str = "id, fingerprint, name, scope, console_account_id, codex_account_id, \
    is_deleted, is_active, deleted_at, expiration_mode, activated_at, activation_duration_seconds, \
    expires_at, rate_limit, cost_limit, created_at";

fn api_key_from_row(row: &Row) -> Result<ApiKey, RelayError> {
    Ok(ApiKey {
        id: row.get(0).map_err(|e| db_err("read id", e))?,
        fingerprint: row.get(1).map_err(|e| db_err("read fingerprint", e))?,
        name: row.get(2).map_err(|e| db_err("read name", e))?,
        scope: scope_from_str(&row.get::<String>(3).map_err(|e| db_err("read scope", e))?),
        console_account_id: row.get(4).map_err(|e| db_err("read console_account_id", e))?,
        codex_account_id: row.get(5).map_err(|e| db_err("read codex_account_id", e))?,
        is_deleted: row.get::<i64>(6).map_err(|e| db_err("read is_deleted", e))? != 0,
        is_active: row.get::<i64>(7).map_err(|e| db_err("read is_active", e))? != 0,
        deleted_at: row.get(8).map_err(|e| db_err("read deleted_at", e))?,
        expiration_mode: expiration_mode_from_str(&row.get::<String>(9).map_err(|e| db_err("read expiration_mode", e))?),
        activated_at: row.get(10).map_err(|e| db_err("read activated_at", e))?,
        activation_duration_seconds: row.get(11).map_err(|e| db_err("read activation_duration_seconds", e))?,
        expires_at: row.get(12).map_err(|e| db_err("read expires_at", e))?,
        rate_limit: row.get::<Option<i64>>(13).map_err(|e| db_err("read rate_limit", e))?.map(|v| v as u64),
        cost_limit: row.get(14).map_err(|e| db_err("read cost_limit", e))?,
        created_at: row.get(15).map_err(|e| db_err("read created_at", e))?,
    })
}

#[async_trait]
impl ApiKeysRepo for SqliteApiKeysRepo {
    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<ApiKey>, RelayError> {
        let conn = connect(&self.db)?;
        let sql = format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE fingerprint = ?");
        let mut rows = conn.query(&sql, (fingerprint,)).await.map_err(|e| db_err("query api key", e))?;
        let Some(row) = rows.next().await.map_err(|e| db_err("fetch api key row", e))? else {
            return Ok(None);
        };
        Ok(Some(api_key_from_row(&row)?))
    }

    async fn upsert(&self, key: ApiKey) -> Result<(), RelayError> {
        let conn = connect(&self.db)?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO api_keys ({API_KEY_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"),
            (
                key.id,
                key.fingerprint,
                key.name,
                scope_to_str(key.scope).to_string(),
                key.console_account_id,
                key.codex_account_id,
                key.is_deleted as i64,
                key.is_active as i64,
                key.deleted_at,
                expiration_mode_to_str(key.expiration_mode).to_string(),
                key.activated_at,
                key.activation_duration_seconds,
                key.expires_at,
                key.rate_limit.map(|v| v as i64),
                key.cost_limit,
                key.created_at,
            ),
        )
        .await
        .map_err(|e| db_err("upsert api key", e))?;
        Ok(())
    }

    async fn soft_delete(&self, id: &str, now_millis: i64) -> Result<(), RelayError> {
        let conn = connect(&self.db)?;
        conn.execute(
            "UPDATE api_keys SET is_deleted = 1, is_active = 0, deleted_at = ? WHERE id = ?",
            (now_millis, id),
        )
        .await
        .map_err(|e| db_err("soft-delete api key", e))?;
        Ok(())
    }
}
