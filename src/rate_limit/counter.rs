use crate::policy::TrafficStrategy;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// QPS window and concurrency staleness threshold
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Quota records kept before expired ones are pruned
const QUOTA_PRUNE_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct QuotaWindow {
    count: u32,
    start: Instant,
}

/// Live admission counters of one API.
///
/// Every window resets once stale, whatever its value, so lost releases
/// cannot block an API forever.
#[derive(Debug)]
pub struct RateCounter {
    concurrent: u32,
    concurrent_updated: Instant,
    qps_count: u32,
    qps_window_start: Instant,
    quotas: HashMap<String, QuotaWindow>,
}

impl RateCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            concurrent: 0,
            concurrent_updated: now,
            qps_count: 0,
            qps_window_start: now,
            quotas: HashMap::new(),
        }
    }

    /// Evaluate every limit that applies and update its bookkeeping.
    /// The call is admitted only if all of them admit it.
    pub fn admit(&mut self, strategy: &TrafficStrategy, param_val: &str, now: Instant) -> bool {
        let mut allowed = true;

        if strategy.limits_qps() {
            allowed &= self.admit_qps(strategy.qps, now);
        }

        if strategy.limits_concurrency() {
            allowed &= self.admit_concurrent(strategy.concurrent, now);
        }

        if !param_val.is_empty() {
            allowed &= self.admit_quota(strategy, param_val, now);
        }

        allowed
    }

    fn admit_qps(&mut self, limit: u32, now: Instant) -> bool {
        if now.saturating_duration_since(self.qps_window_start) > RATE_WINDOW {
            self.qps_count = 1;
            self.qps_window_start = now;
            return true;
        }

        if self.qps_count >= limit {
            return false;
        }

        self.qps_count += 1;
        true
    }

    fn admit_concurrent(&mut self, limit: u32, now: Instant) -> bool {
        if self.concurrent >= limit {
            // Stuck counter: releases were lost, start over from zero
            if now.saturating_duration_since(self.concurrent_updated) > RATE_WINDOW {
                self.concurrent = 0;
                self.concurrent_updated = now;
                return true;
            }
            return false;
        }

        self.concurrent += 1;
        self.concurrent_updated = now;
        true
    }

    fn admit_quota(&mut self, strategy: &TrafficStrategy, param_val: &str, now: Instant) -> bool {
        let span = Duration::from_secs(strategy.span);

        if self.quotas.len() >= QUOTA_PRUNE_THRESHOLD {
            self.quotas
                .retain(|_, w| now.saturating_duration_since(w.start) <= span);
        }

        match self.quotas.get_mut(param_val) {
            None => {
                self.quotas.insert(
                    param_val.to_string(),
                    QuotaWindow {
                        count: 1,
                        start: now,
                    },
                );
                true
            }
            Some(window) if now.saturating_duration_since(window.start) > span => {
                window.count = 1;
                window.start = now;
                true
            }
            Some(window) if window.count >= strategy.times => false,
            Some(window) => {
                window.count += 1;
                true
            }
        }
    }

    /// Give back one concurrency slot; never goes below zero
    pub fn release(&mut self) {
        self.concurrent = self.concurrent.saturating_sub(1);
    }

    pub fn concurrent(&self) -> u32 {
        self.concurrent
    }

    pub fn qps_count(&self) -> u32 {
        self.qps_count
    }
}
