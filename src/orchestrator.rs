//! Request orchestrator: the single entry point a route handler calls once
//! an inbound API key has already been authenticated. Ties together the
//! validator, fingerprinter, scheduler, relayer and usage meter into the
//! end-to-end "accept a Messages-shaped request, return a Messages-shaped
//! response or stream" flow.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;
use tracing::warn;

use crate::constants::MAX_SCHEDULE_ATTEMPTS;
use crate::domain::{ApiKey, Platform};
use crate::error::RelayError;
use crate::headers_cache::HeadersCache;
use crate::relay::{RelayOptions, Relayer};
use crate::scheduler::{ScheduleOptions, ScheduleRequest, Scheduler};
use crate::usage_meter::UsageMeter;
use crate::fingerprint;
use crate::validator::{self, ClientType};

/// What a route handler turns into an HTTP response: a fully-buffered JSON
/// body, or a live passthrough of the upstream SSE stream.
pub enum RelayOutcome {
    Unary(Value),
    Stream(Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>),
}

pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    relayer: Arc<Relayer>,
    headers_cache: Arc<HeadersCache>,
    usage_meter: Arc<UsageMeter>,
}

impl Orchestrator {
    pub fn new(
        scheduler: Arc<Scheduler>,
        relayer: Arc<Relayer>,
        headers_cache: Arc<HeadersCache>,
        usage_meter: Arc<UsageMeter>,
    ) -> Self {
        Self { scheduler, relayer, headers_cache, usage_meter }
    }

    /// Validate, fingerprint, select an account, dispatch upstream, meter
    /// usage. `key` is the caller's already-authenticated API key record.
    pub async fn handle_relay(
        &self,
        key: &ApiKey,
        headers: &HeaderMap,
        body: &Value,
        path: &str,
    ) -> Result<RelayOutcome, RelayError> {
        let validation = validator::validate(headers, body, path);
        if !validation.valid {
            return Err(RelayError::ValidationRejected);
        }

        let fingerprint = fingerprint::derive(body);
        let platform = match validation.client_type {
            ClientType::CodexCli => Platform::Codex,
            ClientType::CodeCli | ClientType::Unknown => Platform::Console,
        };
        let model = body.get("model").and_then(Value::as_str).map(str::to_string);
        let is_streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let dedicated_account_id = key.dedicated_account_for(platform).map(str::to_string);
        let key_id = key.id.as_str();

        let request = ScheduleRequest { platform, model, session_fingerprint: fingerprint, dedicated_account_id };

        let mut exclude_ids: HashSet<String> = HashSet::new();
        let mut last_error: Option<RelayError> = None;

        for _ in 0..MAX_SCHEDULE_ATTEMPTS {
            let options = ScheduleOptions { exclude_ids: exclude_ids.clone(), max_retries: None };
            let selected = match self.scheduler.select_with_retry(&request, &options).await {
                Ok(result) => result,
                Err(err) => {
                    last_error = Some(err);
                    break;
                }
            };

            if validation.client_type == ClientType::CodeCli {
                self.headers_cache.store(&selected.account.id, headers).await;
            }

            let relay_options = RelayOptions::default();
            if is_streaming {
                match self.relayer.relay_stream(&selected.account, body, headers, &relay_options).await {
                    Ok(stream) => {
                        let usage_meter = self.usage_meter.clone();
                        let key_id = key_id.to_string();
                        let usage_rx = stream.usage_rx;
                        tokio::spawn(async move {
                            if let Ok(Some(usage)) = usage_rx.await {
                                let long_context = usage.long_context.is_some();
                                if let Err(e) = usage_meter.increment(&key_id, usage, long_context).await {
                                    warn!(key_id, error = %e, "orchestrator: failed to persist streamed usage");
                                }
                            }
                        });
                        return Ok(RelayOutcome::Stream(stream.stream));
                    }
                    Err(err) => {
                        exclude_ids.insert(selected.account.id.clone());
                        last_error = Some(err);
                        continue;
                    }
                }
            } else {
                match self.relayer.relay_unary(&selected.account, body, headers, &relay_options).await {
                    Ok(unary) => {
                        if let Some(usage) = unary.usage {
                            let long_context = usage.long_context.is_some();
                            if let Err(e) = self.usage_meter.increment(key_id, usage, long_context).await {
                                warn!(key_id, error = %e, "orchestrator: failed to persist usage");
                            }
                        }
                        return Ok(RelayOutcome::Unary(unary.response));
                    }
                    Err(err) => {
                        exclude_ids.insert(selected.account.id.clone());
                        last_error = Some(err);
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(RelayError::NoCandidates(platform)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::LoadBalancer;
    use crate::clock::TzClock;
    use crate::domain::{Account, AccountStatus, AccountType};
    use crate::headers_cache::HeadersCache;
    use crate::proxy::ProxyAgentFactory;
    use crate::store::memory::{
        MemoryAccountsRepo, MemoryHeadersCacheRepo, MemorySessionsRepo, MemoryUsageRepo,
    };
    use axum::http::HeaderValue;
    use serde_json::json;
    use std::collections::HashMap as Map;
    use std::time::Duration;

    fn account(id: &str) -> Account {
        Account {
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
            account_type: AccountType::Shared,
            supported_models: Map::new(),
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

    fn orchestrator(accounts_repo: Arc<MemoryAccountsRepo>) -> Orchestrator {
        let scheduler = Arc::new(Scheduler::new(
            accounts_repo.clone(),
            Arc::new(MemorySessionsRepo::new()),
            Arc::new(LoadBalancer::new()),
            15,
            14,
            5,
        ));
        let headers_cache = Arc::new(HeadersCache::new(Arc::new(MemoryHeadersCacheRepo::new())));
        let relayer = Arc::new(Relayer::new(
            Arc::new(ProxyAgentFactory::new(Duration::from_secs(5))),
            headers_cache.clone(),
            accounts_repo,
            Duration::from_secs(300),
            true,
        ));
        let usage_meter = Arc::new(UsageMeter::new(Arc::new(MemoryUsageRepo::new()), TzClock::new(8)));
        Orchestrator::new(scheduler, relayer, headers_cache, usage_meter)
    }

    fn codex_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("user-agent", HeaderValue::from_static("codex_vscode/0.9.1"));
        h
    }

    fn test_key() -> ApiKey {
        ApiKey {
            id: "k1".into(),
            fingerprint: "fp".into(),
            name: "test key".into(),
            scope: crate::domain::KeyScope::All,
            console_account_id: None,
            codex_account_id: None,
            is_deleted: false,
            is_active: true,
            deleted_at: None,
            expiration_mode: crate::domain::ExpirationMode::Fixed,
            activated_at: None,
            activation_duration_seconds: None,
            expires_at: None,
            rate_limit: None,
            cost_limit: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn unrecognized_client_rejected_before_any_scheduling() {
        let repo = Arc::new(MemoryAccountsRepo::new());
        repo.seed(account("a1"));
        let orch = orchestrator(repo);
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        let err = orch.handle_relay(&test_key(), &headers, &json!({}), "/v1/anything").await.unwrap_err();
        assert!(matches!(err, RelayError::ValidationRejected));
    }

    #[tokio::test]
    async fn no_candidates_surfaces_as_service_unavailable_error() {
        let repo = Arc::new(MemoryAccountsRepo::new());
        let orch = orchestrator(repo);
        let err = orch.handle_relay(&test_key(), &codex_headers(), &json!({}), "/v1/anything").await.unwrap_err();
        let (status, _) = err.status_and_body();
        assert_eq!(status, axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
