//! Per-account headers cache: the most recent observed
//! headers of a recognized CLI, versioned by client semver.
//!
//! All errors are swallowed into warnings; the static fallback table is
//! always a safe return value.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use tracing::warn;

use crate::constants::{CACHED_HEADER_ALLOWLIST, HEADERS_CACHE_TTL_DAYS};
use crate::store::{HeadersCacheRepo, HeadersSnapshot};
use crate::validator::semver;

static FALLBACK_HEADERS: &[(&str, &str)] = &[
    ("user-agent", "claude-cli/1.0.0 (external, cli)"),
    ("x-app", "cli"),
    ("anthropic-beta", crate::constants::DEFAULT_ANTHROPIC_BETA),
];

fn fallback_snapshot() -> HashMap<String, String> {
    FALLBACK_HEADERS.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub struct HeadersCache {
    repo: Arc<dyn HeadersCacheRepo>,
}

impl HeadersCache {
    pub fn new(repo: Arc<dyn HeadersCacheRepo>) -> Self {
        Self { repo }
    }

    /// Filters `client_headers` to the 13-entry allow-list, extracts the
    /// UA semver, and replaces the stored snapshot only if strictly newer.
    pub async fn store(&self, account_id: &str, client_headers: &HeaderMap) {
        let Some(ua) = client_headers.get("user-agent").and_then(|v| v.to_str().ok()) else {
            warn!(account_id, "headers cache: missing user-agent, skipping store");
            return;
        };
        let Some(candidate_version) = extract_semver(ua) else {
            warn!(account_id, "headers cache: unrecognizable CLI user-agent, skipping store");
            return;
        };

        let filtered: HashMap<String, String> = CACHED_HEADER_ALLOWLIST
            .iter()
            .filter_map(|name| {
                client_headers.get(*name).and_then(|v| v.to_str().ok()).map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let current = match self.repo.get(account_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(account_id, error = %e, "headers cache: read failed, proceeding as empty");
                None
            }
        };

        let is_newer = current.as_ref().is_none_or(|c| candidate_version > c.semver);
        if !is_newer {
            return;
        }

        let snapshot = HeadersSnapshot { headers: filtered, semver: candidate_version, updated_at: crate::clock::now_millis() };
        if let Err(e) = self.repo.set(account_id, snapshot, HEADERS_CACHE_TTL_DAYS).await {
            warn!(account_id, error = %e, "headers cache: write failed");
        }
    }

    /// Returns the stored snapshot, or the static fallback table if none
    /// has been cached yet (or the read fails).
    pub async fn get(&self, account_id: &str) -> HashMap<String, String> {
        match self.repo.get(account_id).await {
            Ok(Some(snapshot)) => snapshot.headers,
            Ok(None) => fallback_snapshot(),
            Err(e) => {
                warn!(account_id, error = %e, "headers cache: read failed, using fallback");
                fallback_snapshot()
            }
        }
    }
}

fn extract_semver(ua: &str) -> Option<(u32, u32, u32)> {
    let version = ua
        .split(['/', ' '])
        .find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
    Some(semver::parse(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryHeadersCacheRepo;
    use axum::http::HeaderValue;

    fn headers(ua: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("user-agent", HeaderValue::from_str(ua).unwrap());
        h.insert("x-app", HeaderValue::from_static("cli"));
        h
    }

    #[tokio::test]
    async fn store_then_get_roundtrips() {
        let cache = HeadersCache::new(Arc::new(MemoryHeadersCacheRepo::new()));
        cache.store("a1", &headers("claude-cli/1.2.3 (external, cli)")).await;
        let got = cache.get("a1").await;
        assert_eq!(got.get("user-agent").map(String::as_str), Some("claude-cli/1.2.3 (external, cli)"));
    }

    #[tokio::test]
    async fn missing_entry_returns_fallback() {
        let cache = HeadersCache::new(Arc::new(MemoryHeadersCacheRepo::new()));
        let got = cache.get("unknown").await;
        assert!(got.contains_key("user-agent"));
    }

    #[tokio::test]
    async fn repeated_store_same_version_is_noop() {
        let cache = HeadersCache::new(Arc::new(MemoryHeadersCacheRepo::new()));
        cache.store("a1", &headers("claude-cli/1.2.3 (external, cli)")).await;
        let first = cache.get("a1").await;
        cache.store("a1", &headers("claude-cli/1.2.3 (external, cli)")).await;
        let second = cache.get("a1").await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn lower_version_does_not_replace() {
        let cache = HeadersCache::new(Arc::new(MemoryHeadersCacheRepo::new()));
        cache.store("a1", &headers("claude-cli/2.0.0 (external, cli)")).await;
        cache.store("a1", &headers("claude-cli/1.0.0 (external, cli)")).await;
        let got = cache.get("a1").await;
        assert_eq!(got.get("user-agent").map(String::as_str), Some("claude-cli/2.0.0 (external, cli)"));
    }

    #[tokio::test]
    async fn strictly_greater_version_replaces() {
        let cache = HeadersCache::new(Arc::new(MemoryHeadersCacheRepo::new()));
        cache.store("a1", &headers("claude-cli/1.0.0 (external, cli)")).await;
        cache.store("a1", &headers("claude-cli/1.5.0 (external, cli)")).await;
        let got = cache.get("a1").await;
        assert_eq!(got.get("user-agent").map(String::as_str), Some("claude-cli/1.5.0 (external, cli)"));
    }
}
