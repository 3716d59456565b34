//! Inbound API-key authentication: binds a request to a managed API key
//! record before the orchestrator ever runs — the ambient step that
//! authenticates each inbound request against a managed API key, using
//! the same header-extraction style as the request-path header helpers
//! (`x-api-key` first, then `Authorization: Bearer`).

use std::sync::Arc;

use axum::http::{HeaderMap, header};

use crate::clock::now_millis;
use crate::crypto::fingerprint_key;
use crate::domain::{ApiKey, Platform};
use crate::error::RelayError;
use crate::store::ApiKeysRepo;

/// `x-api-key` first (standard Anthropic-style), then `Authorization: Bearer`.
fn extract_cleartext_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

pub struct KeyAuthenticator {
    keys: Arc<dyn ApiKeysRepo>,
    process_secret: String,
}

impl KeyAuthenticator {
    pub fn new(keys: Arc<dyn ApiKeysRepo>, process_secret: String) -> Self {
        Self { keys, process_secret }
    }

    /// Returns the authenticated key, already checked against soft-delete,
    /// active flag, expiration, and (if `platform` is known) scope. Missing
    /// key, unknown fingerprint, or any failed check all collapse to the
    /// same `ValidationRejected` the client validator would raise — the
    /// relay does not distinguish "wrong client" from "bad key" to callers.
    pub async fn authenticate(&self, headers: &HeaderMap, platform: Platform) -> Result<ApiKey, RelayError> {
        let cleartext = extract_cleartext_key(headers).ok_or(RelayError::ValidationRejected)?;
        let fingerprint = fingerprint_key(cleartext, &self.process_secret);
        let key = self
            .keys
            .find_by_fingerprint(&fingerprint)
            .await?
            .ok_or(RelayError::ValidationRejected)?;

        let now = now_millis();
        if !key.is_usable(now) || !key.allows_platform(platform) {
            return Err(RelayError::ValidationRejected);
        }
        Ok(key)
    }
}
