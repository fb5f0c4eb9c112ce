use crate::error::{GatewayError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::warn;

/// Strategy id meaning "nothing attached"
pub const NO_STRATEGY: i64 = 0;

/// Limit value meaning "unlimited"
pub const STRATEGY_NO_LIMIT: u32 = 0;

/// Retry defaults applied when no retry strategy is in effect
pub const REQ_TIMEOUT_SECS: u64 = 15;
pub const RETRY_TIMES: u32 = 0;
pub const RETRY_INTERVAL_SECS: u64 = 5;

/// BW list sub types
pub const BLACK_LIST: i32 = 1;
pub const WHITE_LIST: i32 = 2;

fn default_modify_date() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn default_method() -> String {
    "GET".to_string()
}

/// How a matched API is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    #[default]
    Sync,
    Redirect,
}

/// How `backend_addr` is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrType {
    /// Full backend URL
    #[default]
    Url,
    /// Service name resolved through discovery
    Discovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Released,
    #[default]
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    BwList,
    Retry,
    Traffic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    On,
    #[default]
    Off,
}

/// API definition row as it comes out of the policy store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRecord {
    pub api_id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub route_type: RouteType,
    #[serde(default)]
    pub addr_type: AddrType,
    #[serde(default)]
    pub backend_addr: String,
    #[serde(default)]
    pub backend_uri: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub bw_strategy: i64,
    #[serde(default)]
    pub retry_strategy: i64,
    #[serde(default)]
    pub traffic_strategy: i64,
    #[serde(default)]
    pub traffic_on: bool,
    #[serde(default)]
    pub traffic_api: String,
    #[serde(default)]
    pub traffic_ratio: u32,
    #[serde(default)]
    pub traffic_ips: String,
    /// Base64 of a JSON array of `{param, rule, test_data}`
    #[serde(default)]
    pub param_rules: String,
    #[serde(default)]
    pub status: ApiStatus,
    #[serde(default = "default_modify_date")]
    pub modify_date: DateTime<Utc>,
}

/// Strategy row as it comes out of the policy store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub service: String,
    #[serde(rename = "type")]
    pub kind: StrategyType,
    #[serde(default)]
    pub sub_type: i32,
    /// JSON text, shape depends on `kind`
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: StrategyStatus,
    #[serde(default = "default_modify_date")]
    pub modify_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
struct ParamRuleRecord {
    param: String,
    rule: String,
    #[serde(default)]
    #[allow(dead_code)]
    test_data: String,
}

/// Decoded API definition, immutable once in the cache
#[derive(Debug, Clone)]
pub struct ApiDefinition {
    pub api_id: String,
    pub service: String,
    pub app: String,
    pub route_type: RouteType,
    pub addr_type: AddrType,
    pub backend_addr: String,
    pub backend_uri: String,
    pub method: Method,
    pub bw_strategy: i64,
    pub retry_strategy: i64,
    pub traffic_strategy: i64,
    pub traffic_on: bool,
    pub traffic_api: String,
    pub traffic_ratio: u32,
    pub traffic_ips: HashSet<String>,
    pub param_rules: HashMap<String, Regex>,
    pub status: ApiStatus,
    pub modify_date: DateTime<Utc>,
}

impl ApiDefinition {
    /// Decode a store row. Bad parameter rules are skipped with a warning.
    pub fn from_record(record: &ApiRecord) -> Self {
        let method = Method::from_bytes(record.method.trim().to_uppercase().as_bytes())
            .unwrap_or_else(|_| {
                warn!(api_id = %record.api_id, method = %record.method, "Invalid method, using GET");
                Method::GET
            });

        let traffic_ips = record
            .traffic_ips
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            api_id: record.api_id.clone(),
            service: record.service.clone(),
            app: record.app.clone(),
            route_type: record.route_type,
            addr_type: record.addr_type,
            backend_addr: record.backend_addr.clone(),
            backend_uri: record.backend_uri.clone(),
            method,
            bw_strategy: record.bw_strategy,
            retry_strategy: record.retry_strategy,
            traffic_strategy: record.traffic_strategy,
            traffic_on: record.traffic_on,
            traffic_api: record.traffic_api.trim().to_string(),
            traffic_ratio: record.traffic_ratio.min(100),
            traffic_ips,
            param_rules: decode_param_rules(&record.api_id, &record.param_rules),
            status: record.status,
            modify_date: record.modify_date,
        }
    }

    pub fn is_released(&self) -> bool {
        self.status == ApiStatus::Released
    }
}

fn decode_param_rules(api_id: &str, raw: &str) -> HashMap<String, Regex> {
    let mut rules = HashMap::new();
    if raw.trim().is_empty() {
        return rules;
    }

    let decoded = match STANDARD.decode(raw.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(api_id, error = %e, "Param rules are not valid base64");
            return rules;
        }
    };

    let records: Vec<ParamRuleRecord> = match serde_json::from_slice(&decoded) {
        Ok(records) => records,
        Err(e) => {
            warn!(api_id, error = %e, "Param rules are not valid JSON");
            return rules;
        }
    };

    for record in records {
        if record.param.is_empty() || record.rule.is_empty() {
            continue;
        }
        match Regex::new(&record.rule) {
            Ok(re) => {
                rules.insert(record.param, re);
            }
            Err(e) => {
                warn!(api_id, param = %record.param, error = %e, "Skipping invalid param rule");
            }
        }
    }

    rules
}

/// What a BW entry compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Ip,
    Param,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BwMode {
    Black,
    White,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BwEntry {
    #[serde(rename = "type")]
    pub kind: MatchKind,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub val: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BwStrategy {
    pub mode: BwMode,
    pub entries: Vec<BwEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStrategy {
    #[serde(default = "default_req_timeout")]
    pub req_timeout: u64,
    #[serde(default)]
    pub retry_times: u32,
    #[serde(default)]
    pub retry_interval: u64,
}

fn default_req_timeout() -> u64 {
    REQ_TIMEOUT_SECS
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            req_timeout: REQ_TIMEOUT_SECS,
            retry_times: RETRY_TIMES,
            retry_interval: RETRY_INTERVAL_SECS,
        }
    }
}

impl RetryStrategy {
    /// Per-attempt timeout; `0` falls back to the default
    pub fn req_timeout(&self) -> Duration {
        match self.req_timeout {
            0 => Duration::from_secs(REQ_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

/// Traffic limits. `0` means no limit for `qps` and `concurrent`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrafficStrategy {
    #[serde(default)]
    pub qps: u32,
    #[serde(default)]
    pub concurrent: u32,
    /// Parameter whose value is quota-limited per user
    #[serde(default)]
    pub param: String,
    /// Quota window in seconds
    #[serde(default)]
    pub span: u64,
    /// Requests allowed per quota window
    #[serde(default)]
    pub times: u32,
    // Circuit breaker settings, carried but not acted upon by routing
    #[serde(default)]
    pub fuse_error: u32,
    #[serde(default)]
    pub fuse_error_count: u32,
    #[serde(default)]
    pub fuse_percent: u32,
    #[serde(default)]
    pub fuse_recover: u32,
    #[serde(default)]
    pub fuse_recover_count: u32,
}

impl TrafficStrategy {
    pub fn limits_qps(&self) -> bool {
        self.qps != STRATEGY_NO_LIMIT
    }

    pub fn limits_concurrency(&self) -> bool {
        self.concurrent != STRATEGY_NO_LIMIT
    }
}

/// Strategy payload, decoded once at load time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyDetail {
    BwList(BwStrategy),
    Retry(RetryStrategy),
    Traffic(TrafficStrategy),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub service: String,
    pub status: StrategyStatus,
    pub detail: StrategyDetail,
    pub modify_date: DateTime<Utc>,
}

impl Strategy {
    /// Decode a store row
    pub fn from_record(record: &StrategyRecord) -> Result<Self> {
        let detail = match record.kind {
            StrategyType::BwList => {
                let mode = match record.sub_type {
                    BLACK_LIST => BwMode::Black,
                    WHITE_LIST => BwMode::White,
                    other => {
                        return Err(GatewayError::Store(format!(
                            "strategy {}: unknown bw sub type {}",
                            record.id, other
                        )))
                    }
                };
                let entries = if record.content.trim().is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_str(&record.content)?
                };
                StrategyDetail::BwList(BwStrategy { mode, entries })
            }
            StrategyType::Retry => StrategyDetail::Retry(serde_json::from_str(&record.content)?),
            StrategyType::Traffic => {
                StrategyDetail::Traffic(serde_json::from_str(&record.content)?)
            }
        };

        Ok(Self {
            id: record.id,
            name: record.name.clone(),
            service: record.service.clone(),
            status: record.status,
            detail,
            modify_date: record.modify_date,
        })
    }

    pub fn is_on(&self) -> bool {
        self.status == StrategyStatus::On
    }

    pub fn as_bw(&self) -> Option<&BwStrategy> {
        match &self.detail {
            StrategyDetail::BwList(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_retry(&self) -> Option<&RetryStrategy> {
        match &self.detail {
            StrategyDetail::Retry(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_traffic(&self) -> Option<&TrafficStrategy> {
        match &self.detail {
            StrategyDetail::Traffic(s) => Some(s),
            _ => None,
        }
    }
}
