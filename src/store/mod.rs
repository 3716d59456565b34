//! Abstract repositories consumed by the relay core.
//!
//! Two implementations exist: [`memory`] (in-process, used by unit and
//! integration tests) and [`sqlite`] (turso-backed, used in production).

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::{AccountStatus, ApiKey, Platform, UsageCounters};
use crate::error::RelayError;

/// A partial update to an account's health fields.
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    pub status: Option<AccountStatus>,
    pub error_message: Option<Option<String>>,
    pub rate_limited_at: Option<Option<i64>>,
    pub last_used_at: Option<i64>,
    pub daily_usage: Option<u64>,
}

#[async_trait]
pub trait AccountsRepo: Send + Sync {
    async fn find_by_id(
        &self,
        platform: Platform,
        id: &str,
    ) -> Result<Option<crate::domain::Account>, RelayError>;

    async fn find_all(&self, platform: Platform) -> Result<Vec<crate::domain::Account>, RelayError>;

    async fn update(
        &self,
        platform: Platform,
        id: &str,
        patch: AccountPatch,
    ) -> Result<(), RelayError>;
}

/// A sticky session binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub account_id: String,
    pub platform: Platform,
}

#[async_trait]
pub trait SessionsRepo: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Result<Option<SessionBinding>, RelayError>;

    async fn set(
        &self,
        fingerprint: &str,
        binding: SessionBinding,
        ttl_days: i64,
    ) -> Result<(), RelayError>;

    /// Returns true iff the TTL was extended.
    async fn extend_if_needed(
        &self,
        fingerprint: &str,
        ttl_days: i64,
        renewal_threshold_days: i64,
    ) -> Result<bool, RelayError>;

    async fn delete(&self, fingerprint: &str) -> Result<(), RelayError>;
}

#[async_trait]
pub trait UsageRepo: Send + Sync {
    /// Pipelined multi-bucket increment. `day`/`month`/`hour`
    /// are pre-computed bucket keys (see [`crate::clock::TzClock`]).
    async fn increment_usage(
        &self,
        key_id: &str,
        day: &str,
        month: &str,
        hour: &str,
        usage: crate::domain::Usage,
        long_context: bool,
    ) -> Result<(), RelayError>;

    /// Exposed for tests verifying the round-trip / doubling law.
    async fn get_counters(
        &self,
        key_id: &str,
        bucket: &str,
    ) -> Result<Option<UsageCounters>, RelayError>;
}

/// A cached per-account snapshot of the last observed CLI headers.
#[derive(Debug, Clone)]
pub struct HeadersSnapshot {
    pub headers: HashMap<String, String>,
    pub semver: (u32, u32, u32),
    pub updated_at: i64,
}

#[async_trait]
pub trait HeadersCacheRepo: Send + Sync {
    async fn get(&self, account_id: &str) -> Result<Option<HeadersSnapshot>, RelayError>;

    async fn set(
        &self,
        account_id: &str,
        snapshot: HeadersSnapshot,
        ttl_days: i64,
    ) -> Result<(), RelayError>;
}

#[async_trait]
pub trait ApiKeysRepo: Send + Sync {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ApiKey>, RelayError>;

    async fn upsert(&self, key: ApiKey) -> Result<(), RelayError>;

    async fn soft_delete(&self, id: &str, now_millis: i64) -> Result<(), RelayError>;
}
