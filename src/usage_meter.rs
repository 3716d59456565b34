//! Usage meter: atomic, multi-resolution counter updates per
//! key, pipelined in one round-trip across four time buckets.

use std::sync::Arc;

use crate::clock::TzClock;
use crate::domain::Usage;
use crate::error::RelayError;
use crate::store::UsageRepo;

pub struct UsageMeter {
    repo: Arc<dyn UsageRepo>,
    clock: TzClock,
}

impl UsageMeter {
    pub fn new(repo: Arc<dyn UsageRepo>, clock: TzClock) -> Self {
        Self { repo, clock }
    }

    /// `long_context` increments the lifetime-only long-context variants in
    /// addition to the four standard buckets.
    pub async fn increment(&self, key_id: &str, usage: Usage, long_context: bool) -> Result<(), RelayError> {
        let (day, month, hour) = self.clock.buckets();
        self.repo.increment_usage(key_id, &day, &month, &hour, usage, long_context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryUsageRepo;

    #[tokio::test]
    async fn increment_applied_twice_doubles_counters() {
        let repo = Arc::new(MemoryUsageRepo::new());
        let meter = UsageMeter::new(repo.clone(), TzClock::new(8));
        let usage = Usage { input_tokens: 10, output_tokens: 5, ..Default::default() };

        meter.increment("key1", usage, false).await.unwrap();
        meter.increment("key1", usage, false).await.unwrap();

        let counters = repo.get_counters("key1", "lifetime").await.unwrap().unwrap();
        assert_eq!(counters.input_tokens, 20);
        assert_eq!(counters.output_tokens, 10);
        assert_eq!(counters.requests, 2);
    }

    #[tokio::test]
    async fn long_context_flag_only_affects_lifetime_bucket() {
        use crate::domain::LongContextUsage;
        let repo = Arc::new(MemoryUsageRepo::new());
        let meter = UsageMeter::new(repo.clone(), TzClock::new(8));
        let usage = Usage {
            input_tokens: 1,
            long_context: Some(LongContextUsage { input_tokens: 100, output_tokens: 50, requests: 1 }),
            ..Default::default()
        };
        meter.increment("key1", usage, true).await.unwrap();

        let lifetime = repo.get_counters("key1", "lifetime").await.unwrap().unwrap();
        assert_eq!(lifetime.long_context_input_tokens, 100);

        let (day, _, _) = TzClock::new(8).buckets();
        let day_counters = repo.get_counters("key1", &day).await.unwrap().unwrap();
        assert_eq!(day_counters.long_context_input_tokens, 0);
    }
}
