//! Per-request state built once by the router.

use crate::policy::{ApiDefinition, BwStrategy, PolicySnapshot, RetryStrategy, Strategy, TrafficStrategy};
use http::{header, HeaderMap, Method};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Request parameter that turns on per-request logging; never forwarded
pub const DEBUG_PARAM: &str = "__debug";

/// Generates request ids: time-based, last digit is the server id
#[derive(Debug)]
pub struct RidGenerator {
    server_id: i64,
    last: AtomicI64,
}

impl RidGenerator {
    pub fn new(server_id: i64) -> Self {
        Self {
            server_id: server_id.rem_euclid(10),
            last: AtomicI64::new(0),
        }
    }

    /// Strictly increasing within this process
    pub fn next(&self) -> i64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        let now = (nanos / 10) * 10 + self.server_id;

        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = if now > prev { now } else { prev + 10 };
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Parameters from the query string and a form-encoded body. Last value wins.
/// Returns the parameters and whether debug logging was requested.
pub fn parse_params(
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> (BTreeMap<String, String>, bool) {
    let mut params = BTreeMap::new();
    let mut debug = false;

    let mut collect = |input: &[u8]| {
        for (k, v) in url::form_urlencoded::parse(input) {
            if k == DEBUG_PARAM {
                debug = v == "true";
            } else {
                params.insert(k.into_owned(), v.into_owned());
            }
        }
    };

    if let Some(q) = query {
        collect(q.as_bytes());
    }

    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if is_form && !body.is_empty() {
        collect(body);
    }

    (params, debug)
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|p| p.ip().to_string()).unwrap_or_default()
}

/// Raw `Cookie` header values
pub fn cookies(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect()
}

/// Everything known about one request
#[derive(Clone)]
pub struct RequestContext {
    pub rid: i64,
    pub method: Method,
    pub params: BTreeMap<String, String>,
    /// Original query string, used verbatim by redirects
    pub raw_query: String,
    pub cookies: Vec<String>,
    pub client_ip: String,
    pub debug: bool,
    /// Resolved API; canary routing may swap it
    pub api: Arc<ApiDefinition>,
    /// Snapshot the request was resolved against
    pub policies: Arc<PolicySnapshot>,

    bw: Option<Arc<Strategy>>,
    retry: RetryStrategy,
    traffic: Option<Arc<Strategy>>,
    traffic_strategy_id: i64,
}

impl RequestContext {
    /// Build a context for `api`, resolving its strategies from `policies`.
    /// Unknown, switched-off or mistyped strategies fall back to the defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rid: i64,
        method: Method,
        params: BTreeMap<String, String>,
        raw_query: String,
        cookies: Vec<String>,
        client_ip: String,
        debug: bool,
        api: Arc<ApiDefinition>,
        policies: Arc<PolicySnapshot>,
    ) -> Self {
        let bw = policies
            .active_strategy(api.bw_strategy)
            .filter(|s| s.as_bw().is_some())
            .cloned();
        let retry = policies
            .active_strategy(api.retry_strategy)
            .and_then(|s| s.as_retry().copied())
            .unwrap_or_default();
        let traffic = policies
            .active_strategy(api.traffic_strategy)
            .filter(|s| s.as_traffic().is_some())
            .cloned();
        let traffic_strategy_id = api.traffic_strategy;

        Self {
            rid,
            method,
            params,
            raw_query,
            cookies,
            client_ip,
            debug,
            api,
            policies,
            bw,
            retry,
            traffic,
            traffic_strategy_id,
        }
    }

    pub fn bw_strategy(&self) -> Option<&BwStrategy> {
        self.bw.as_ref().and_then(|s| s.as_bw())
    }

    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry
    }

    /// Traffic limits in effect; `None` means unlimited
    pub fn traffic_strategy(&self) -> Option<&TrafficStrategy> {
        self.traffic.as_ref().and_then(|s| s.as_traffic())
    }

    /// Id of the traffic strategy attached when the context was built (0 = none)
    pub fn traffic_strategy_id(&self) -> i64 {
        self.traffic_strategy_id
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("rid", &self.rid)
            .field("method", &self.method)
            .field("params", &self.params)
            .field("api_id", &self.api.api_id)
            .field("client_ip", &self.client_ip)
            .finish()
    }
}
