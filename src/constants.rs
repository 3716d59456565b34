/// Canonical `anthropic-version` header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default `anthropic-beta` header value, used unless a request overrides it
/// via `RelayOptions::beta_header`.
pub const DEFAULT_ANTHROPIC_BETA: &str = "prompt-caching-2024-07-31";

/// Upstream dispatch timeout default.
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 300;

/// Request-edge timeout default.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Sticky-session mapping TTL.
pub const SESSION_TTL_DAYS: i64 = 15;

/// Renewal deadband: extend the TTL back to `SESSION_TTL_DAYS` when the
/// remaining TTL falls below this many days.
pub const SESSION_RENEWAL_THRESHOLD_DAYS: i64 = 14;

/// Headers-cache snapshot retention.
pub const HEADERS_CACHE_TTL_DAYS: i64 = 7;

/// Usage bucket retention. Lifetime has no TTL.
pub const USAGE_DAY_RETENTION_DAYS: i64 = 90;
pub const USAGE_MONTH_RETENTION_DAYS: i64 = 365;
pub const USAGE_HOUR_RETENTION_DAYS: i64 = 7;

/// Default timezone offset used for usage bucket keys.
pub const DEFAULT_TZ_OFFSET_HOURS: i32 = 8;

/// Maximum scheduler selection attempts per request.
pub const MAX_SCHEDULE_ATTEMPTS: u32 = 5;

/// Default scheduler retry budget passed to `selectWithRetry`.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default outbound address family preference.
pub const DEFAULT_PROXY_USE_IPV4: bool = true;

/// Allow-listed CLI-identifying headers cached per account.
/// Thirteen entries, lower-cased.
pub const CACHED_HEADER_ALLOWLIST: &[&str] = &[
    "user-agent",
    "x-app",
    "anthropic-beta",
    "anthropic-dangerous-direct-browser-access",
    "x-stainless-lang",
    "x-stainless-package-version",
    "x-stainless-os",
    "x-stainless-arch",
    "x-stainless-runtime",
    "x-stainless-runtime-version",
    "x-stainless-retry-count",
    "x-stainless-timeout",
    "x-stainless-helper-method",
];

/// Headers stripped from the inbound request before forwarding upstream
///.
pub const STRIPPED_INBOUND_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "cookie",
    "anthropic-version",
    "anthropic-beta",
    "anthropic-client-id",
    "x-claude-trace-id",
    "x-request-id",
    "referer",
    "origin",
    "host",
];
