//! Core data model: accounts, API keys, sessions, usage, proxies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Which upstream family an account talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Console,
    Codex,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Console => "console",
            Platform::Codex => "codex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Dedicated,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Error,
    RateLimited,
    Unauthorized,
    Overloaded,
    Blocked,
    QuotaExceeded,
    TempError,
}

/// Proxy protocol an account may dial outbound through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub protocol: ProxyProtocol,
    pub host: String,
    /// Valid range [1, 65535]; validated at construction (`Account::validate`).
    pub port: u16,
    #[serde(default)]
    pub auth: Option<ProxyAuth>,
}

/// An upstream credential. See spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub platform: Platform,
    pub name: String,
    pub description: String,

    pub api_url: String,
    pub user_agent: Option<String>,
    pub proxy: Option<ProxyConfig>,

    /// Cleartext is never stored; repositories hold the output of
    /// `crypto::SecretCipher::encrypt`. Kept as `String` here because this
    /// type represents the decrypted, in-memory view a request handler
    /// works with once the repository has decrypted it.
    pub api_key: String,

    /// Smaller is higher priority. Valid range [1, 100].
    pub priority: u8,
    pub schedulable: bool,
    pub account_type: AccountType,
    /// Empty map means "supports all models, no rewrite."
    pub supported_models: HashMap<String, String>,

    pub is_active: bool,
    pub status: AccountStatus,
    pub error_message: Option<String>,
    pub rate_limited_at: Option<i64>,
    pub rate_limit_duration_minutes: Option<i64>,
    pub daily_quota: u64,
    pub daily_usage: u64,
    pub quota_reset_time: Option<String>,
    pub quota_stopped_at: Option<i64>,
    pub last_used_at: Option<i64>,
}

impl Account {
    /// Prefix that decides the upstream auth scheme.
    pub const ANTHROPIC_KEY_PREFIX: &'static str = "sk-ant-";

    pub fn uses_x_api_key_auth(&self) -> bool {
        self.api_key.starts_with(Self::ANTHROPIC_KEY_PREFIX)
    }

    /// Whether this account supports `model`, per spec.md §4.4 step 2.
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.is_empty() || self.supported_models.contains_key(model)
    }

    /// Apply the account's model mapping, if any.
    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        if self.supported_models.is_empty() {
            return model;
        }
        self.supported_models
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }

    /// "Currently rate-limited" per spec.md §3.
    pub fn is_currently_rate_limited(&self, now_millis: i64) -> bool {
        let Some(rate_limited_at) = self.rate_limited_at else {
            return false;
        };
        let duration_minutes = self.rate_limit_duration_minutes.unwrap_or(0);
        let elapsed_minutes = (now_millis - rate_limited_at) / 60_000;
        elapsed_minutes < duration_minutes
    }

    /// The §3 availability predicate.
    pub fn is_available(&self, now_millis: i64) -> bool {
        self.is_active
            && self.schedulable
            && self.status == AccountStatus::Active
            && !self.is_currently_rate_limited(now_millis)
            && (self.daily_quota == 0 || self.daily_usage < self.daily_quota)
    }

    /// Range/consistency invariants from spec.md §3. Returns the first
    /// violation found, if any.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(1..=100).contains(&self.priority) {
            return Err("priority out of range [1, 100]");
        }
        if let Some(proxy) = &self.proxy
            && !(1..=65535).contains(&proxy.port)
        {
            return Err("proxy port out of range [1, 65535]");
        }
        if self.status == AccountStatus::RateLimited && self.rate_limited_at.is_none() {
            return Err("rate_limited status requires rate_limited_at");
        }
        Ok(())
    }
}

/// Permission scope for an inbound API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScope {
    All,
    Console,
    Codex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpirationMode {
    Fixed,
    Activation,
}

/// Identity for an inbound caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    /// SHA-256(cleartext || process secret), lowercase hex.
    pub fingerprint: String,
    pub name: String,
    pub scope: KeyScope,
    pub console_account_id: Option<String>,
    pub codex_account_id: Option<String>,
    pub is_deleted: bool,
    pub is_active: bool,
    pub deleted_at: Option<i64>,
    pub expiration_mode: ExpirationMode,
    pub activated_at: Option<i64>,
    pub activation_duration_seconds: Option<i64>,
    pub expires_at: Option<i64>,
    pub rate_limit: Option<u64>,
    pub cost_limit: Option<f64>,
    pub created_at: i64,
}

impl ApiKey {
    /// A key bound to a specific account for its scope's platform.
    pub fn dedicated_account_for(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Console => self.console_account_id.as_deref(),
            Platform::Codex => self.codex_account_id.as_deref(),
        }
    }

    pub fn allows_platform(&self, platform: Platform) -> bool {
        match self.scope {
            KeyScope::All => true,
            KeyScope::Console => platform == Platform::Console,
            KeyScope::Codex => platform == Platform::Codex,
        }
    }

    pub fn is_usable(&self, now_millis: i64) -> bool {
        if self.is_deleted || !self.is_active {
            return false;
        }
        match self.expiration_mode {
            ExpirationMode::Fixed => self.expires_at.is_none_or(|exp| now_millis < exp),
            ExpirationMode::Activation => match (self.activated_at, self.activation_duration_seconds) {
                (Some(start), Some(dur)) => now_millis < start + dur * 1000,
                _ => true,
            },
        }
    }
}

/// Token counts carried by a single usage increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_create_tokens: u64,
    pub cache_read_tokens: u64,
    pub ephemeral_5m_tokens: Option<u64>,
    pub ephemeral_1h_tokens: Option<u64>,
    pub long_context: Option<LongContextUsage>,
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LongContextUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub requests: u64,
}

impl Usage {
    pub fn core_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn all_tokens(&self) -> u64 {
        self.core_tokens() + self.cache_create_tokens + self.cache_read_tokens
    }
}

/// The persisted per-bucket counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_create_tokens: u64,
    pub cache_read_tokens: u64,
    pub requests: u64,
    pub ephemeral_5m_tokens: u64,
    pub ephemeral_1h_tokens: u64,
    pub long_context_input_tokens: u64,
    pub long_context_output_tokens: u64,
    pub long_context_requests_tokens: u64,
    pub cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_account() -> Account {
        Account {
            id: "a1".into(),
            platform: Platform::Console,
            name: "a1".into(),
            description: String::new(),
            api_url: "https://example.test".into(),
            user_agent: None,
            proxy: None,
            api_key: "sk-ant-abc".into(),
            priority: 10,
            schedulable: true,
            account_type: AccountType::Shared,
            supported_models: HashMap::new(),
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
        }
    }

    #[test]
    fn available_account_passes_predicate() {
        assert!(base_account().is_available(1_000_000));
    }

    #[test]
    fn inactive_account_unavailable() {
        let mut a = base_account();
        a.is_active = false;
        assert!(!a.is_available(1_000_000));
    }

    #[test]
    fn rate_limited_window_expires() {
        let mut a = base_account();
        a.status = AccountStatus::RateLimited;
        a.rate_limited_at = Some(0);
        a.rate_limit_duration_minutes = Some(5);
        // status != Active regardless, so unavailable either way
        assert!(!a.is_available(10 * 60_000));
        assert!(a.is_currently_rate_limited(2 * 60_000));
        assert!(!a.is_currently_rate_limited(10 * 60_000));
    }

    #[test]
    fn daily_quota_exhausted() {
        let mut a = base_account();
        a.daily_quota = 100;
        a.daily_usage = 100;
        assert!(!a.is_available(0));
    }

    #[test]
    fn empty_supported_models_supports_all() {
        let a = base_account();
        assert!(a.supports_model("anything"));
        assert_eq!(a.map_model("anything"), "anything");
    }

    #[test]
    fn model_mapping_applies() {
        let mut a = base_account();
        a.supported_models
            .insert("claude-opus-4".into(), "claude-opus-4-upstream".into());
        assert!(a.supports_model("claude-opus-4"));
        assert!(!a.supports_model("claude-haiku-4"));
        assert_eq!(a.map_model("claude-opus-4"), "claude-opus-4-upstream");
        assert_eq!(a.map_model("claude-haiku-4"), "claude-haiku-4");
    }

    #[test]
    fn x_api_key_auth_detection() {
        let mut a = base_account();
        a.api_key = "sk-ant-abcdef".into();
        assert!(a.uses_x_api_key_auth());
        a.api_key = "not-anthropic".into();
        assert!(!a.uses_x_api_key_auth());
    }

    #[test]
    fn validate_rejects_bad_priority() {
        let mut a = base_account();
        a.priority = 0;
        assert!(a.validate().is_err());
    }

    #[test]
    fn usage_all_tokens_invariant() {
        let u = Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_create_tokens: 2,
            cache_read_tokens: 1,
            ..Default::default()
        };
        assert!(u.all_tokens() >= u.input_tokens + u.output_tokens);
        assert!(u.all_tokens() >= u.core_tokens() + u.cache_create_tokens + u.cache_read_tokens);
    }
}
