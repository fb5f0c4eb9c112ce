//! Request filters.
//!
//! Four hooks surround every request:
//!
//! 1. `before_route`: black/white list, parameter rules, canary routing
//! 2. `before_call`: admission control, before each backend attempt
//! 3. `after_call`: admission release, after each backend attempt
//! 4. `route_failed`: called when routing fails
//!
//! Each hook returns a [`FilterResult`]; a non-zero status stops the request.

pub mod bw_list;
pub mod canary;
pub mod param_verify;

use crate::context::RequestContext;
use crate::error::{ErrorResponse, GatewayError};
use crate::metrics;
use crate::rpc::{Admission, TrafficConReq};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a hook; `status == 0` means continue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterResult {
    pub status: u16,
    pub error_code: u32,
    pub message: String,
}

impl FilterResult {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn is_pass(&self) -> bool {
        self.status == 0
    }

    /// Client-facing body for a stopped request
    pub fn into_error_response(self, rid: i64) -> ErrorResponse {
        ErrorResponse {
            rid,
            status: self.status,
            error_code: self.error_code,
            message: self.message,
        }
    }
}

impl From<GatewayError> for FilterResult {
    fn from(e: GatewayError) -> Self {
        Self {
            status: e.status_code().as_u16(),
            error_code: e.error_code(),
            message: e.to_string(),
        }
    }
}

/// The gateway's hook set; admission goes through the limiter link
#[derive(Clone)]
pub struct FilterChain {
    admission: Arc<dyn Admission>,
}

impl FilterChain {
    pub fn new(admission: Arc<dyn Admission>) -> Self {
        Self { admission }
    }

    /// BW list, then parameter rules, then canary routing
    pub fn before_route(&self, ctx: &mut RequestContext) -> FilterResult {
        if let Err(e) = bw_list::check(ctx) {
            info!(rid = ctx.rid, api_id = %ctx.api.api_id, error = %e, "Before route failed");
            metrics::record_limited(&ctx.api);
            return e.into();
        }

        if let Err(e) = param_verify::verify(ctx) {
            info!(rid = ctx.rid, api_id = %ctx.api.api_id, error = %e, "Before route failed");
            return e.into();
        }

        canary::route(ctx);

        FilterResult::pass()
    }

    /// Ask the limiter for a slot. Link or call failures let the request through.
    pub async fn before_call(&self, ctx: &RequestContext) -> FilterResult {
        let Some(req) = admission_request(ctx) else {
            return FilterResult::pass();
        };

        match self.admission.inc_api_rate(req).await {
            Ok(true) => FilterResult::pass(),
            Ok(false) => {
                metrics::record_limited(&ctx.api);
                GatewayError::TooManyRequests(format!(
                    "too many requests for {}, over the configured threshold",
                    ctx.api.api_id
                ))
                .into()
            }
            Err(e) => {
                warn!(rid = ctx.rid, api_id = %ctx.api.api_id, error = %e, "Admission check failed, letting request through");
                FilterResult::pass()
            }
        }
    }

    /// Give the concurrency slot back; errors are only logged
    pub async fn after_call(&self, ctx: &RequestContext) -> FilterResult {
        if let Some(req) = release_request(ctx) {
            if let Err(e) = self.admission.dec_api_rate(req).await {
                warn!(rid = ctx.rid, api_id = %ctx.api.api_id, error = %e, "Admission release failed");
            }
        }
        FilterResult::pass()
    }

    pub fn route_failed(&self, _ctx: &RequestContext) -> FilterResult {
        FilterResult::pass()
    }
}

/// `IncApiRate` request, if any limit applies to this call
pub fn admission_request(ctx: &RequestContext) -> Option<TrafficConReq> {
    if ctx.traffic_strategy_id() == crate::policy::model::NO_STRATEGY {
        return None;
    }
    let traffic = ctx.traffic_strategy()?;

    let param_val = if traffic.param.is_empty() {
        ""
    } else {
        ctx.param(&traffic.param).unwrap_or_default()
    };

    if !traffic.limits_qps() && !traffic.limits_concurrency() && param_val.is_empty() {
        return None;
    }

    Some(TrafficConReq {
        api_id: ctx.api.api_id.clone(),
        strategy_id: ctx.traffic_strategy_id(),
        param_val: param_val.to_string(),
    })
}

/// `DecApiRate` request, only when concurrency is limited
pub fn release_request(ctx: &RequestContext) -> Option<TrafficConReq> {
    if ctx.traffic_strategy_id() == crate::policy::model::NO_STRATEGY {
        return None;
    }
    if !ctx.traffic_strategy()?.limits_concurrency() {
        return None;
    }

    Some(TrafficConReq {
        api_id: ctx.api.api_id.clone(),
        strategy_id: ctx.traffic_strategy_id(),
        param_val: String::new(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Result;
    use crate::policy::{
        ApiRecord, CacheScope, PolicyBatch, PolicyCache, StrategyRecord, StrategyStatus,
        StrategyType,
    };
    use async_trait::async_trait;
    use http::Method;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    pub(crate) fn strategy_record(
        id: i64,
        kind: StrategyType,
        sub_type: i32,
        content: &str,
    ) -> StrategyRecord {
        StrategyRecord {
            id,
            name: String::new(),
            service: String::new(),
            kind,
            sub_type,
            content: content.to_string(),
            status: StrategyStatus::On,
            modify_date: chrono::Utc::now(),
        }
    }

    pub(crate) fn context_with(
        api: ApiRecord,
        other_apis: Vec<ApiRecord>,
        strategies: Vec<StrategyRecord>,
        client_ip: &str,
        params: &[(&str, &str)],
    ) -> RequestContext {
        let api_id = api.api_id.clone();
        let mut apis = vec![api];
        apis.extend(other_apis);

        let cache = PolicyCache::new(CacheScope::Full);
        cache.replace(PolicyBatch { apis, strategies });
        let snapshot = cache.snapshot();
        let api = snapshot.api(&api_id).cloned().expect("api in snapshot");

        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        RequestContext::new(
            1,
            Method::GET,
            params,
            String::new(),
            vec![],
            client_ip.to_string(),
            false,
            api,
            snapshot,
        )
    }

    /// `order.v1` with bw=1, retry=2, traffic=3
    pub(crate) fn context(
        client_ip: &str,
        params: &[(&str, &str)],
        strategies: Vec<StrategyRecord>,
    ) -> RequestContext {
        let api: ApiRecord = serde_yaml::from_str(
            "api_id: order.v1\nbw_strategy: 1\nretry_strategy: 2\ntraffic_strategy: 3\nstatus: released",
        )
        .expect("api record");
        context_with(api, vec![], strategies, client_ip, params)
    }

    /// Records calls; answers with `allow` or fails when `down`
    #[derive(Default)]
    pub(crate) struct FakeAdmission {
        pub allow: bool,
        pub down: bool,
        pub incs: Mutex<Vec<TrafficConReq>>,
        pub decs: Mutex<Vec<TrafficConReq>>,
    }

    #[async_trait]
    impl Admission for FakeAdmission {
        async fn inc_api_rate(&self, req: TrafficConReq) -> Result<bool> {
            self.incs.lock().push(req);
            if self.down {
                return Err(GatewayError::Rpc("link down".to_string()));
            }
            Ok(self.allow)
        }

        async fn dec_api_rate(&self, req: TrafficConReq) -> Result<()> {
            self.decs.lock().push(req);
            if self.down {
                return Err(GatewayError::Rpc("link down".to_string()));
            }
            Ok(())
        }
    }

    fn traffic(content: &str) -> StrategyRecord {
        strategy_record(3, StrategyType::Traffic, 0, content)
    }

    #[test]
    fn test_no_admission_without_limits() {
        let ctx = context("1.1.1.1", &[], vec![]);
        assert!(admission_request(&ctx).is_none());

        let ctx = context("1.1.1.1", &[], vec![traffic(r#"{"param":"uid","times":1}"#)]);
        assert!(admission_request(&ctx).is_none());
    }

    #[test]
    fn test_admission_with_quota_param() {
        let ctx = context(
            "1.1.1.1",
            &[("uid", "alice")],
            vec![traffic(r#"{"param":"uid","span":60,"times":1}"#)],
        );
        let req = admission_request(&ctx).unwrap();
        assert_eq!(req.api_id, "order.v1");
        assert_eq!(req.strategy_id, 3);
        assert_eq!(req.param_val, "alice");
        assert!(release_request(&ctx).is_none());
    }

    #[test]
    fn test_release_only_for_concurrency() {
        let ctx = context("1.1.1.1", &[], vec![traffic(r#"{"concurrent":2}"#)]);
        assert!(admission_request(&ctx).is_some());
        assert!(release_request(&ctx).is_some());

        let ctx = context("1.1.1.1", &[], vec![traffic(r#"{"qps":2}"#)]);
        assert!(release_request(&ctx).is_none());
    }

    #[tokio::test]
    async fn test_before_call_refusal() {
        let chain = FilterChain::new(Arc::new(FakeAdmission {
            allow: false,
            ..Default::default()
        }));
        let ctx = context("1.1.1.1", &[], vec![traffic(r#"{"qps":1}"#)]);

        let result = chain.before_call(&ctx).await;
        assert_eq!(result.status, 429);
        assert_eq!(result.error_code, crate::error::codes::ACCESS_LIMITED);
    }

    #[tokio::test]
    async fn test_before_call_fails_open() {
        let admission = Arc::new(FakeAdmission {
            down: true,
            ..Default::default()
        });
        let chain = FilterChain::new(admission.clone());
        let ctx = context("1.1.1.1", &[], vec![traffic(r#"{"concurrent":1}"#)]);

        assert!(chain.before_call(&ctx).await.is_pass());
        assert!(chain.after_call(&ctx).await.is_pass());
        assert_eq!(admission.incs.lock().len(), 1);
        assert_eq!(admission.decs.lock().len(), 1);
    }

    #[test]
    fn test_before_route_order() {
        let chain = FilterChain::new(Arc::new(FakeAdmission::default()));
        let bw = strategy_record(
            1,
            StrategyType::BwList,
            1,
            r#"[{"type":"ip","key":"","val":"1.2.3.4"}]"#,
        );

        let mut ctx = context("1.2.3.4", &[], vec![bw]);
        let result = chain.before_route(&mut ctx);
        assert_eq!(result.status, 403);
        assert_eq!(result.error_code, crate::error::codes::FORBIDDEN);

        let mut ctx = context("5.5.5.5", &[], vec![]);
        assert!(chain.before_route(&mut ctx).is_pass());
        assert!(chain.route_failed(&ctx).is_pass());
    }
}
