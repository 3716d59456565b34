//! Account scheduler: select/attach/detach a sticky session,
//! filter available accounts, drive retries.

use std::collections::HashSet;
use std::sync::Arc;

use crate::balancer::LoadBalancer;
use crate::clock::now_millis;
use crate::domain::{Account, Platform};
use crate::error::RelayError;
use crate::store::{AccountsRepo, SessionBinding, SessionsRepo};

#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub platform: Platform,
    pub model: Option<String>,
    pub session_fingerprint: Option<String>,
    /// If the caller's API key is bound to a specific account for this
    /// platform, routing must stay on that account rather than entering
    /// the shared priority/balance pool.
    pub dedicated_account_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub exclude_ids: HashSet<String>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ScheduleResult {
    pub account: Account,
    pub is_sticky: bool,
    pub attempt_count: u32,
}

pub struct Scheduler {
    accounts: Arc<dyn AccountsRepo>,
    sessions: Arc<dyn SessionsRepo>,
    balancer: Arc<LoadBalancer>,
    session_ttl_days: i64,
    session_renewal_threshold_days: i64,
    default_max_retries: u32,
}

impl Scheduler {
    pub fn new(
        accounts: Arc<dyn AccountsRepo>,
        sessions: Arc<dyn SessionsRepo>,
        balancer: Arc<LoadBalancer>,
        session_ttl_days: i64,
        session_renewal_threshold_days: i64,
        default_max_retries: u32,
    ) -> Self {
        Self {
            accounts,
            sessions,
            balancer,
            session_ttl_days,
            session_renewal_threshold_days,
            default_max_retries,
        }
    }

    /// Dedicated-account fast path, then sticky fast path, then filter,
    /// sort by priority, and balance within the lowest surviving priority
    /// tier.
    pub async fn select_account(
        &self,
        request: &ScheduleRequest,
        options: &ScheduleOptions,
    ) -> Result<ScheduleResult, RelayError> {
        // Step 0: a key dedicated to one account never enters the shared
        // pool, win or lose.
        if let Some(account_id) = &request.dedicated_account_id {
            return self.select_dedicated(account_id, request, options).await;
        }

        // Step 1: sticky fast path.
        if let Some(fingerprint) = &request.session_fingerprint
            && let Some(result) = self.try_sticky(fingerprint, request, options).await?
        {
            return Ok(result);
        }

        // Step 2: filter.
        let all = self.accounts.find_all(request.platform).await?;
        let now = now_millis();
        let filtered: Vec<Account> = all
            .into_iter()
            .filter(|a| !options.exclude_ids.contains(&a.id))
            .filter(|a| a.is_available(now))
            .filter(|a| request.model.as_deref().is_none_or(|m| a.supports_model(m)))
            .collect();

        // Step 3: fail distinctly.
        if filtered.is_empty() {
            return Err(match &request.model {
                Some(model) => RelayError::NoModelSupport(model.clone()),
                None => RelayError::NoCandidates(request.platform),
            });
        }

        // Step 4: balance over ascending-priority-sorted candidates.
        let mut sorted = filtered;
        sorted.sort_by_key(|a| a.priority);
        let chosen = self.balancer.pick(&sorted).clone();

        // Step 5: attach.
        if let Some(fingerprint) = &request.session_fingerprint {
            self.sessions
                .set(
                    fingerprint,
                    SessionBinding { account_id: chosen.id.clone(), platform: chosen.platform },
                    self.session_ttl_days,
                )
                .await?;
        }

        Ok(ScheduleResult { account: chosen, is_sticky: false, attempt_count: 1 })
    }

    async fn select_dedicated(
        &self,
        account_id: &str,
        request: &ScheduleRequest,
        options: &ScheduleOptions,
    ) -> Result<ScheduleResult, RelayError> {
        let account = self.accounts.find_by_id(request.platform, account_id).await?;
        let now = now_millis();
        let usable = account.as_ref().is_some_and(|a| {
            !options.exclude_ids.contains(&a.id)
                && a.is_available(now)
                && request.model.as_deref().is_none_or(|m| a.supports_model(m))
        });

        match (account, usable) {
            (Some(account), true) => Ok(ScheduleResult { account, is_sticky: false, attempt_count: 1 }),
            (_, _) => Err(match &request.model {
                Some(model) => RelayError::NoModelSupport(model.clone()),
                None => RelayError::NoCandidates(request.platform),
            }),
        }
    }

    async fn try_sticky(
        &self,
        fingerprint: &str,
        request: &ScheduleRequest,
        options: &ScheduleOptions,
    ) -> Result<Option<ScheduleResult>, RelayError> {
        let Some(binding) = self.sessions.get(fingerprint).await? else {
            return Ok(None);
        };

        let Some(account) = self.accounts.find_by_id(binding.platform, &binding.account_id).await? else {
            self.sessions.delete(fingerprint).await?;
            return Ok(None);
        };

        let excluded = options.exclude_ids.contains(&account.id);
        let now = now_millis();
        let supports_model = request.model.as_deref().is_none_or(|m| account.supports_model(m));

        if excluded || !account.is_available(now) || !supports_model {
            self.sessions.delete(fingerprint).await?;
            return Ok(None);
        }

        self.sessions
            .extend_if_needed(fingerprint, self.session_ttl_days, self.session_renewal_threshold_days)
            .await?;

        Ok(Some(ScheduleResult { account, is_sticky: true, attempt_count: 1 }))
    }

    /// Retry wrapper. Does not itself mutate
    /// `options.exclude_ids` — the orchestrator owns growing that set between
    /// attempts.
    pub async fn select_with_retry(
        &self,
        request: &ScheduleRequest,
        options: &ScheduleOptions,
    ) -> Result<ScheduleResult, RelayError> {
        let max_retries = options.max_retries.unwrap_or(self.default_max_retries).max(1);
        let mut last_error = None;
        let mut attempt: HashSet<String> = options.exclude_ids.clone();

        for attempt_count in 1..=max_retries {
            let attempt_options = ScheduleOptions { exclude_ids: attempt.clone(), max_retries: options.max_retries };
            match self.select_account(request, &attempt_options).await {
                Ok(mut result) => {
                    result.attempt_count = attempt_count;
                    return Ok(result);
                }
                Err(err) => {
                    last_error = Some(err);
                }
            }
            // No new account ID to exclude from this failure alone; the
            // orchestrator drives cross-attempt exclusion via repeated calls
            // once an attempt's *chosen* account later fails downstream.
            attempt = options.exclude_ids.clone();
        }

        Err(RelayError::RetryExhausted(Box::new(
            last_error.unwrap_or(RelayError::NoCandidates(request.platform)),
        )))
    }
}
