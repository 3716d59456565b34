//! Upstream relayer: header rewriting, proxy-aware dispatch,
//! bidirectional streaming with inline SSE usage extraction, and mapping of
//! upstream failure modes to account state transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::clock::now_millis;
use crate::constants::{ANTHROPIC_VERSION, DEFAULT_ANTHROPIC_BETA, STRIPPED_INBOUND_HEADERS};
use crate::domain::{Account, AccountStatus, Usage};
use crate::error::RelayError;
use crate::headers_cache::HeadersCache;
use crate::proxy::ProxyAgentFactory;
use crate::sse::{SseUsageScanner, usage_from_unary_response};
use crate::store::{AccountPatch, AccountsRepo};

#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    pub custom_path: Option<String>,
    pub beta_header: Option<String>,
    pub timeout: Option<Duration>,
}

pub struct UnaryResult {
    pub response: Value,
    pub usage: Option<Usage>,
}

/// A byte-for-byte passthrough stream paired with an awaitable usage
/// completion` callback).
pub struct RelayStream {
    pub stream: std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>,
    pub usage_rx: oneshot::Receiver<Option<Usage>>,
}

impl RelayStream {
    /// Resolves once `message_stop` is observed, or to `None` if the stream
    /// ends (or is cancelled) without it.
    pub async fn usage(self) -> Option<Usage> {
        self.usage_rx.await.unwrap_or(None)
    }
}

pub struct Relayer {
    proxy_factory: Arc<ProxyAgentFactory>,
    headers_cache: Arc<HeadersCache>,
    accounts: Arc<dyn AccountsRepo>,
    default_timeout: Duration,
    proxy_use_ipv4_default: bool,
}

impl Relayer {
    pub fn new(
        proxy_factory: Arc<ProxyAgentFactory>,
        headers_cache: Arc<HeadersCache>,
        accounts: Arc<dyn AccountsRepo>,
        default_timeout: Duration,
        proxy_use_ipv4_default: bool,
    ) -> Self {
        Self { proxy_factory, headers_cache, accounts, default_timeout, proxy_use_ipv4_default }
    }

    /// Strips inbound auth/identity headers, re-adds the account's own
    /// credential and client headers, and sets the canonical version/beta
    /// headers.
    async fn build_headers(&self, account: &Account, client_headers: &HeaderMap, options: &RelayOptions) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in client_headers.iter() {
            let lower = name.as_str().to_ascii_lowercase();
            if STRIPPED_INBOUND_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }

        for (name, value) in self.headers_cache.get(&account.id).await {
            if let (Ok(name), Ok(value)) =
                (axum::http::HeaderName::try_from(name), axum::http::HeaderValue::from_str(&value))
            {
                headers.insert(name, value);
            }
        }

        if account.uses_x_api_key_auth() {
            headers.insert("x-api-key", account.api_key.parse().expect("api key header value"));
        } else {
            headers.insert(
                axum::http::header::AUTHORIZATION,
                format!("Bearer {}", account.api_key).parse().expect("bearer header value"),
            );
        }

        headers.insert("anthropic-version", ANTHROPIC_VERSION.parse().expect("static header value"));
        let beta = options.beta_header.clone().unwrap_or_else(|| DEFAULT_ANTHROPIC_BETA.to_string());
        headers.insert("anthropic-beta", beta.parse().unwrap_or_else(|_| DEFAULT_ANTHROPIC_BETA.parse().unwrap()));

        if let Some(ua) = &account.user_agent
            && !ua.is_empty()
            && let Ok(value) = ua.parse()
        {
            headers.insert(axum::http::header::USER_AGENT, value);
        }

        headers
    }

    fn target_url(&self, account: &Account, options: &RelayOptions) -> String {
        let path = options.custom_path.as_deref().unwrap_or("/v1/messages");
        format!("{}{}", account.api_url.trim_end_matches('/'), path)
    }

    /// Shallow-copies the body, remapping `body.model` through the
    /// account's `supported_models` table.
    fn mapped_body(&self, account: &Account, body: &Value) -> Value {
        let mut mapped = body.clone();
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            let target = account.map_model(model);
            if target != model
                && let Some(obj) = mapped.as_object_mut()
            {
                obj.insert("model".to_string(), Value::String(target.to_string()));
            }
        }
        mapped
    }

    fn client_for(&self, account: &Account) -> reqwest::Client {
        self.proxy_factory.client_for(account.proxy.as_ref(), None, self.proxy_use_ipv4_default)
    }

    /// Reads the upstream status and applies the error-to-account-state
    /// mapping table. Always refreshes `last_used_at`.
    async fn record_dispatch_outcome(&self, account: &Account, status: Option<u16>) {
        let mut patch = AccountPatch { last_used_at: Some(now_millis()), ..Default::default() };

        if let Some(status) = status {
            let (mapped_status, message) = match status {
                401 => (Some(AccountStatus::Unauthorized), Some("API key is invalid or expired".to_string())),
                429 => (Some(AccountStatus::RateLimited), Some("Rate limit exceeded".to_string())),
                529 => (Some(AccountStatus::Overloaded), None),
                s if (500..600).contains(&s) => {
                    (Some(AccountStatus::TempError), Some(format!("Server error: {s}")))
                }
                _ => (None, None),
            };
            patch.status = mapped_status;
            if message.is_some() {
                patch.error_message = Some(message);
            }
        }

        if let Err(e) = self.accounts.update(account.platform, &account.id, patch).await {
            warn!(account_id = %account.id, error = %e, "relayer: failed to persist account health update");
        }
    }

    pub async fn relay_unary(
        &self,
        account: &Account,
        body: &Value,
        client_headers: &HeaderMap,
        options: &RelayOptions,
    ) -> Result<UnaryResult, RelayError> {
        let headers = self.build_headers(account, client_headers, options).await;
        let url = self.target_url(account, options);
        let mapped_body = self.mapped_body(account, body);
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let client = self.client_for(account);

        let response = client.post(&url).headers(headers).timeout(timeout).json(&mapped_body).send().await;

        let response = match response {
            Ok(resp) => resp,
            Err(e) => {
                self.record_dispatch_outcome(account, None).await;
                return Err(RelayError::UpstreamTransport(e.to_string()));
            }
        };

        let status = response.status();
        self.record_dispatch_outcome(account, Some(status.as_u16())).await;

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RelayError::UpstreamStatus { status: status.as_u16(), message });
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| RelayError::UpstreamTransport(format!("invalid JSON response: {e}")))?;
        let usage = usage_from_unary_response(&parsed);
        Ok(UnaryResult { response: parsed, usage })
    }

    pub async fn relay_stream(
        &self,
        account: &Account,
        body: &Value,
        client_headers: &HeaderMap,
        options: &RelayOptions,
    ) -> Result<RelayStream, RelayError> {
        let headers = self.build_headers(account, client_headers, options).await;
        let url = self.target_url(account, options);
        let mapped_body = self.mapped_body(account, body);
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let client = self.client_for(account);

        let response = client.post(&url).headers(headers).timeout(timeout).json(&mapped_body).send().await;

        let response = match response {
            Ok(resp) => resp,
            Err(e) => {
                self.record_dispatch_outcome(account, None).await;
                return Err(RelayError::UpstreamTransport(e.to_string()));
            }
        };

        let status = response.status();
        self.record_dispatch_outcome(account, Some(status.as_u16())).await;

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RelayError::UpstreamStatus { status: status.as_u16(), message });
        }

        let (usage_tx, usage_rx) = oneshot::channel();
        let upstream = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut scanner = SseUsageScanner::new();
            let mut sent = false;
            let mut upstream = std::pin::pin!(upstream);

            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if let Some(usage) = scanner.feed(&bytes) {
                            sent = true;
                            let _ = usage_tx.send(Some(usage));
                        }
                        yield Ok(bytes);
                    }
                    Err(e) => {
                        if !sent {
                            let _ = usage_tx.send(None);
                        }
                        yield Err(RelayError::Stream(e.to_string()));
                        return;
                    }
                }
            }
            if !sent {
                let _ = usage_tx.send(None);
            }
        };

        Ok(RelayStream { stream: Box::pin(stream), usage_rx })
    }
}
