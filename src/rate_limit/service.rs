use super::counter::RateCounter;
use crate::policy::PolicyCache;
use crate::rpc::{RpcCall, RpcReply, TrafficConReq, TrafficConRes};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Admission counters shared by every gateway instance, one per API
pub struct RateLimiterService {
    policies: Arc<PolicyCache>,
    counters: DashMap<String, Arc<Mutex<RateCounter>>>,
}

impl RateLimiterService {
    pub fn new(policies: Arc<PolicyCache>) -> Self {
        Self {
            policies,
            counters: DashMap::new(),
        }
    }

    /// Count one call against the API's limits; `false` means refused
    pub fn inc_api_rate(&self, req: &TrafficConReq) -> bool {
        self.inc_api_rate_at(req, Instant::now())
    }

    pub fn inc_api_rate_at(&self, req: &TrafficConReq, now: Instant) -> bool {
        let snapshot = self.policies.snapshot();
        let Some(strategy) = snapshot
            .active_strategy(req.strategy_id)
            .and_then(|s| s.as_traffic())
        else {
            // Unknown or switched off: no limit
            return true;
        };

        let counter = self
            .counters
            .entry(req.api_id.clone())
            .or_insert_with(|| {
                debug!(api_id = %req.api_id, "Creating rate counter");
                Arc::new(Mutex::new(RateCounter::new(now)))
            })
            .clone();

        let allowed = counter.lock().admit(strategy, &req.param_val, now);
        if !allowed {
            debug!(
                api_id = %req.api_id,
                strategy_id = req.strategy_id,
                param_val = %req.param_val,
                "Admission refused"
            );
        }
        allowed
    }

    /// Release one concurrency slot; no-op for APIs never admitted
    pub fn dec_api_rate(&self, req: &TrafficConReq) {
        let counter = self.counters.get(&req.api_id).map(|c| c.value().clone());
        if let Some(counter) = counter {
            counter.lock().release();
        }
    }

    /// Liveness probe; always answers 1
    pub fn ping(&self, _seq: i64) -> i64 {
        1
    }

    /// Current concurrency of an API, if it has a counter
    pub fn concurrent(&self, api_id: &str) -> Option<u32> {
        self.counters.get(api_id).map(|c| c.lock().concurrent())
    }

    /// Answer one RPC call
    pub fn handle(&self, call: RpcCall) -> RpcReply {
        match call {
            RpcCall::IncApiRate(req) => RpcReply::Rate(TrafficConRes {
                suc: self.inc_api_rate(&req),
            }),
            RpcCall::DecApiRate(req) => {
                self.dec_api_rate(&req);
                RpcReply::Rate(TrafficConRes { suc: true })
            }
            RpcCall::Ping(seq) => RpcReply::Pong(self.ping(seq)),
        }
    }
}
