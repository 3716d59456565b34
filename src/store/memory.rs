//! In-memory repository implementations, used for fast deterministic tests.
//!
//! TTLs are modeled as an `expires_at` millisecond timestamp checked on
//! read, with expired rows treated as absent rather than eagerly swept.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::domain::{Account, ApiKey, Platform, Usage, UsageCounters};
use crate::error::RelayError;

use super::{AccountPatch, AccountsRepo, ApiKeysRepo, HeadersCacheRepo, HeadersSnapshot, SessionBinding, SessionsRepo, UsageRepo};

fn now_millis() -> i64 {
    crate::clock::now_millis()
}

const DAY_MILLIS: i64 = 86_400_000;

#[derive(Default)]
pub struct MemoryAccountsRepo {
    inner: RwLock<HashMap<(Platform, String), Account>>,
}

impl MemoryAccountsRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, account: Account) {
        self.inner
            .write()
            .unwrap()
            .insert((account.platform, account.id.clone()), account);
    }
}

#[async_trait]
impl AccountsRepo for MemoryAccountsRepo {
    async fn find_by_id(&self, platform: Platform, id: &str) -> Result<Option<Account>, RelayError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .get(&(platform, id.to_string()))
            .cloned())
    }

    async fn find_all(&self, platform: Platform) -> Result<Vec<Account>, RelayError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .values()
            .filter(|a| a.platform == platform)
            .cloned()
            .collect())
    }

    async fn update(&self, platform: Platform, id: &str, patch: AccountPatch) -> Result<(), RelayError> {
        let mut guard = self.inner.write().unwrap();
        let account = guard
            .get_mut(&(platform, id.to_string()))
            .ok_or_else(|| RelayError::Repository(format!("no account {platform}/{id}")))?;
        if let Some(status) = patch.status {
            account.status = status;
        }
        if let Some(error_message) = patch.error_message {
            account.error_message = error_message;
        }
        if let Some(rate_limited_at) = patch.rate_limited_at {
            account.rate_limited_at = rate_limited_at;
        }
        if let Some(last_used_at) = patch.last_used_at {
            account.last_used_at = Some(last_used_at);
        }
        if let Some(daily_usage) = patch.daily_usage {
            account.daily_usage = daily_usage;
        }
        Ok(())
    }
}

struct StoredSession {
    binding: SessionBinding,
    expires_at: i64,
}

#[derive(Default)]
pub struct MemorySessionsRepo {
    inner: RwLock<HashMap<String, StoredSession>>,
}

impl MemorySessionsRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionsRepo for MemorySessionsRepo {
    async fn get(&self, fingerprint: &str) -> Result<Option<SessionBinding>, RelayError> {
        let guard = self.inner.read().unwrap();
        let Some(stored) = guard.get(fingerprint) else {
            return Ok(None);
        };
        if stored.expires_at <= now_millis() {
            return Ok(None);
        }
        Ok(Some(stored.binding.clone()))
    }

    async fn set(&self, fingerprint: &str, binding: SessionBinding, ttl_days: i64) -> Result<(), RelayError> {
        self.inner.write().unwrap().insert(
            fingerprint.to_string(),
            StoredSession {
                binding,
                expires_at: now_millis() + ttl_days * DAY_MILLIS,
            },
        );
        Ok(())
    }

    async fn extend_if_needed(
        &self,
        fingerprint: &str,
        ttl_days: i64,
        renewal_threshold_days: i64,
    ) -> Result<bool, RelayError> {
        let mut guard = self.inner.write().unwrap();
        let Some(stored) = guard.get_mut(fingerprint) else {
            return Ok(false);
        };
        let now = now_millis();
        let remaining_days = (stored.expires_at - now) / DAY_MILLIS;
        if remaining_days < renewal_threshold_days {
            stored.expires_at = now + ttl_days * DAY_MILLIS;
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete(&self, fingerprint: &str) -> Result<(), RelayError> {
        self.inner.write().unwrap().remove(fingerprint);
        Ok(())
    }
}

struct StoredCounters {
    counters: UsageCounters,
    /// `None` means no TTL (the lifetime bucket). Stamped on first write
    /// only, matching the sqlite backend: a bucket's calendar period never
    /// changes, so re-incrementing it never pushes the expiry back out.
    expires_at: Option<i64>,
}

#[derive(Default)]
pub struct MemoryUsageRepo {
    inner: RwLock<HashMap<(String, String), StoredCounters>>,
}

impl MemoryUsageRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, key_id: &str, bucket: &str, usage: &Usage, long_context: bool, retention_days: Option<i64>) {
        let mut guard = self.inner.write().unwrap();
        let stored = guard
            .entry((key_id.to_string(), bucket.to_string()))
            .or_insert_with(|| StoredCounters {
                counters: UsageCounters::default(),
                expires_at: retention_days.map(|days| now_millis() + days * DAY_MILLIS),
            });
        let counters = &mut stored.counters;
        counters.input_tokens += usage.input_tokens;
        counters.output_tokens += usage.output_tokens;
        counters.cache_create_tokens += usage.cache_create_tokens;
        counters.cache_read_tokens += usage.cache_read_tokens;
        counters.requests += 1;
        counters.ephemeral_5m_tokens += usage.ephemeral_5m_tokens.unwrap_or(0);
        counters.ephemeral_1h_tokens += usage.ephemeral_1h_tokens.unwrap_or(0);
        counters.cost += usage.cost.unwrap_or(0.0);
        if long_context
            && let Some(lc) = usage.long_context
        {
            counters.long_context_input_tokens += lc.input_tokens;
            counters.long_context_output_tokens += lc.output_tokens;
            counters.long_context_requests_tokens += lc.requests;
        }
    }
}

#[async_trait]
impl UsageRepo for MemoryUsageRepo {
    async fn increment_usage(
        &self,
        key_id: &str,
        day: &str,
        month: &str,
        hour: &str,
        usage: Usage,
        long_context: bool,
    ) -> Result<(), RelayError> {
        use crate::constants::{USAGE_DAY_RETENTION_DAYS, USAGE_HOUR_RETENTION_DAYS, USAGE_MONTH_RETENTION_DAYS};
        // "Lifetime" only receives the long-context increment, and carries no TTL.
        self.bump(key_id, "lifetime", &usage, long_context, None);
        self.bump(key_id, day, &usage, false, Some(USAGE_DAY_RETENTION_DAYS));
        self.bump(key_id, month, &usage, false, Some(USAGE_MONTH_RETENTION_DAYS));
        self.bump(key_id, hour, &usage, false, Some(USAGE_HOUR_RETENTION_DAYS));
        Ok(())
    }

    async fn get_counters(&self, key_id: &str, bucket: &str) -> Result<Option<UsageCounters>, RelayError> {
        let guard = self.inner.read().unwrap();
        let Some(stored) = guard.get(&(key_id.to_string(), bucket.to_string())) else {
            return Ok(None);
        };
        if stored.expires_at.is_some_and(|exp| exp <= now_millis()) {
            return Ok(None);
        }
        Ok(Some(stored.counters))
    }
}

struct StoredHeaders {
    snapshot: HeadersSnapshot,
    expires_at: i64,
}

#[derive(Default)]
pub struct MemoryHeadersCacheRepo {
    inner: RwLock<HashMap<String, StoredHeaders>>,
}

impl MemoryHeadersCacheRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HeadersCacheRepo for MemoryHeadersCacheRepo {
    async fn get(&self, account_id: &str) -> Result<Option<HeadersSnapshot>, RelayError> {
        let guard = self.inner.read().unwrap();
        let Some(stored) = guard.get(account_id) else {
            return Ok(None);
        };
        if stored.expires_at <= now_millis() {
            return Ok(None);
        }
        Ok(Some(stored.snapshot.clone()))
    }

    async fn set(&self, account_id: &str, snapshot: HeadersSnapshot, ttl_days: i64) -> Result<(), RelayError> {
        self.inner.write().unwrap().insert(
            account_id.to_string(),
            StoredHeaders {
                snapshot,
                expires_at: now_millis() + ttl_days * DAY_MILLIS,
            },
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryApiKeysRepo {
    inner: RwLock<HashMap<String, ApiKey>>,
}

impl MemoryApiKeysRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeysRepo for MemoryApiKeysRepo {
    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<ApiKey>, RelayError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .values()
            .find(|k| k.fingerprint == fingerprint)
            .cloned())
    }

    async fn upsert(&self, key: ApiKey) -> Result<(), RelayError> {
        self.inner.write().unwrap().insert(key.id.clone(), key);
        Ok(())
    }

    async fn soft_delete(&self, id: &str, now_millis: i64) -> Result<(), RelayError> {
        let mut guard = self.inner.write().unwrap();
        if let Some(key) = guard.get_mut(id) {
            key.is_deleted = true;
            key.is_active = false;
            key.deleted_at = Some(now_millis);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str) -> Account {
        crate::domain::Account {
            id: id.into(),
            platform: Platform::Console,
            name: id.into(),
            description: String::new(),
            api_url: "https://example.test".into(),
            user_agent: None,
            proxy: None,
            api_key: "sk-ant-x".into(),
            priority: 10,
            schedulable: true,
            account_type: crate::domain::AccountType::Shared,
            supported_models: HashMap::new(),
            is_active: true,
            status: crate::domain::AccountStatus::Active,
            error_message: None,
            rate_limited_at: None,
            rate_limit_duration_minutes: None,
            daily_quota: 0,
            daily_usage: 0,
            quota_reset_time: None,
            quota_stopped_at: None,
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn accounts_update_patches_fields() {
        let repo = MemoryAccountsRepo::new();
        repo.seed(account("a1"));
        repo.update(
            Platform::Console,
            "a1",
            AccountPatch {
                status: Some(crate::domain::AccountStatus::RateLimited),
                error_message: Some(Some("Rate limit exceeded".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let found = repo.find_by_id(Platform::Console, "a1").await.unwrap().unwrap();
        assert_eq!(found.status, crate::domain::AccountStatus::RateLimited);
        assert_eq!(found.error_message.as_deref(), Some("Rate limit exceeded"));
    }

    #[tokio::test]
    async fn session_set_then_get_roundtrips() {
        let repo = MemorySessionsRepo::new();
        repo.set(
            "fp1",
            SessionBinding { account_id: "a1".into(), platform: Platform::Console },
            15,
        )
        .await
        .unwrap();
        let got = repo.get("fp1").await.unwrap().unwrap();
        assert_eq!(got.account_id, "a1");
    }

    #[tokio::test]
    async fn extend_if_needed_renews_when_under_threshold() {
        let repo = MemorySessionsRepo::new();
        let binding = SessionBinding { account_id: "a1".into(), platform: Platform::Console };
        repo.set("fp1", binding, 10).await.unwrap();

        let renewed = repo.extend_if_needed("fp1", 15, 14).await.unwrap();
        assert!(renewed);

        let remaining_days = {
            let guard = repo.inner.read().unwrap();
            (guard.get("fp1").unwrap().expires_at - now_millis()) / DAY_MILLIS
        };
        assert!(remaining_days > 14 && remaining_days <= 15);
    }

    #[tokio::test]
    async fn extend_if_needed_leaves_fresh_mapping_untouched() {
        let repo = MemorySessionsRepo::new();
        let binding = SessionBinding { account_id: "a1".into(), platform: Platform::Console };
        repo.set("fp1", binding, 15).await.unwrap();

        let expires_before = repo.inner.read().unwrap().get("fp1").unwrap().expires_at;
        let renewed = repo.extend_if_needed("fp1", 15, 14).await.unwrap();
        assert!(!renewed);
        let expires_after = repo.inner.read().unwrap().get("fp1").unwrap().expires_at;
        assert_eq!(expires_before, expires_after);
    }

    #[tokio::test]
    async fn usage_increment_applied_twice_doubles_counters() {
        let repo = MemoryUsageRepo::new();
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_create_tokens: 1,
            cache_read_tokens: 1,
            ..Default::default()
        };
        repo.increment_usage("k1", "2026-07-28", "2026-07", "2026-07-28:00", usage, false)
            .await
            .unwrap();
        repo.increment_usage("k1", "2026-07-28", "2026-07", "2026-07-28:00", usage, false)
            .await
            .unwrap();
        let counters = repo.get_counters("k1", "lifetime").await.unwrap().unwrap();
        assert_eq!(counters.input_tokens, 20);
        assert_eq!(counters.output_tokens, 10);
        assert_eq!(counters.requests, 2);
    }

    #[tokio::test]
    async fn usage_lifetime_bucket_never_expires() {
        let repo = MemoryUsageRepo::new();
        let usage = Usage { input_tokens: 10, ..Default::default() };
        repo.increment_usage("k1", "2026-07-28", "2026-07", "2026-07-28:00", usage, false)
            .await
            .unwrap();
        assert!(repo.inner.read().unwrap().get(&("k1".to_string(), "lifetime".to_string())).unwrap().expires_at.is_none());
    }

    #[tokio::test]
    async fn usage_expired_day_bucket_reads_as_absent() {
        let repo = MemoryUsageRepo::new();
        let usage = Usage { input_tokens: 10, ..Default::default() };
        repo.increment_usage("k1", "2026-07-28", "2026-07", "2026-07-28:00", usage, false)
            .await
            .unwrap();
        {
            let mut guard = repo.inner.write().unwrap();
            let stored = guard.get_mut(&("k1".to_string(), "2026-07-28".to_string())).unwrap();
            stored.expires_at = Some(now_millis() - 1);
        }
        assert!(repo.get_counters("k1", "2026-07-28").await.unwrap().is_none());
    }
}
