//! Priority group + round-robin load balancer.
//!
//! Owned by the composition root (`AppState`) as an injectable, resettable
//! service — this and the derived encryption key are the only process-wide
//! singletons.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{Account, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CounterKey {
    platform: Platform,
    priority: u8,
}

/// Per-process, per-`(platform, priority)` round-robin counter.
#[derive(Default)]
pub struct LoadBalancer {
    counters: Mutex<HashMap<CounterKey, u64>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `candidates` must be non-empty and pre-sorted ascending by priority
    ///. Panics only violate that contract, which the
    /// caller (the scheduler) is responsible for upholding.
    pub fn pick<'a>(&self, candidates: &'a [Account]) -> &'a Account {
        assert!(!candidates.is_empty(), "load balancer requires a non-empty candidate list");

        let min_priority = candidates.iter().map(|a| a.priority).min().expect("non-empty");
        let group: Vec<&Account> = candidates.iter().filter(|a| a.priority == min_priority).collect();

        if group.len() == 1 {
            return group[0];
        }

        let key = CounterKey { platform: group[0].platform, priority: min_priority };
        let index = {
            let mut counters = self.counters.lock().expect("load balancer mutex poisoned");
            let counter = counters.entry(key).or_insert(0);
            let current = *counter;
            *counter = counter.wrapping_add(1);
            current
        };

        group[(index as usize) % group.len()]
    }

    /// Test affordance: empties the counter map.
    pub fn reset(&self) {
        self.counters.lock().expect("load balancer mutex poisoned").clear();
    }
}
