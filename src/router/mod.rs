//! Request routing: identity resolution, filters and dispatch.

use crate::context::{self, RequestContext, RidGenerator};
use crate::error::{ErrorResponse, GatewayError, Result};
use crate::filter::FilterChain;
use crate::metrics::{ApiLabels, RequestTimer};
use crate::policy::{PolicyCache, RouteType};
use crate::proxy::BackendDispatcher;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Everything the catch-all handler needs
#[derive(Clone)]
pub struct GatewayState {
    pub cache: Arc<PolicyCache>,
    pub rid: Arc<RidGenerator>,
    pub filters: FilterChain,
    pub dispatcher: BackendDispatcher,
    pub entry_path: Arc<str>,
}

impl GatewayState {
    pub fn new(
        cache: Arc<PolicyCache>,
        rid: RidGenerator,
        filters: FilterChain,
        dispatcher: BackendDispatcher,
        entry_path: &str,
    ) -> Self {
        Self {
            cache,
            rid: Arc::new(rid),
            filters,
            dispatcher,
            entry_path: Arc::from(entry_path),
        }
    }
}

/// Gateway app: one catch-all route for every method and path
pub fn build_app(state: GatewayState) -> Router {
    Router::new()
        .fallback(gateway_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Cache key of the requested API: `name + ".v" + version`.
/// On the entry path the name comes from `service_id`, then `api_name`;
/// elsewhere the path itself is the name.
pub fn resolve_api_id(
    path: &str,
    params: &BTreeMap<String, String>,
    entry_path: &str,
) -> Result<String> {
    let name = if path == entry_path {
        ["service_id", "api_name"]
            .iter()
            .filter_map(|key| params.get(*key))
            .find(|v| !v.is_empty())
            .ok_or(GatewayError::MissingApiName)?
            .as_str()
    } else {
        path
    };

    let version = params
        .get("api_version")
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .unwrap_or("1");

    Ok(format!("{}.v{}", name, version))
}

async fn gateway_handler(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let timer = RequestTimer::start();
    let rid = state.rid.next();
    let mut labels = ApiLabels::unknown();

    let peer = peer.map(|ConnectInfo(addr)| addr);
    let response = match route_request(&state, rid, method, &uri, &headers, peer, &body, &mut labels).await {
        Ok(response) => response,
        Err(e) => {
            debug!(rid, status = e.status, error_code = e.error_code, message = %e.message, "Request rejected");
            e.into_response()
        }
    };

    timer.record(&labels);
    response
}

#[allow(clippy::too_many_arguments)]
async fn route_request(
    state: &GatewayState,
    rid: i64,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    body: &[u8],
    labels: &mut ApiLabels,
) -> std::result::Result<Response, ErrorResponse> {
    let (params, debug_on) = context::parse_params(uri.query(), headers, body);

    let api_id = resolve_api_id(uri.path(), &params, &state.entry_path).map_err(|e| e.with_rid(rid))?;

    let policies = state.cache.snapshot();
    let api = policies
        .api(&api_id)
        .cloned()
        .ok_or_else(|| GatewayError::UnknownApi(api_id.clone()).with_rid(rid))?;
    *labels = ApiLabels::from(api.as_ref());

    if !api.is_released() {
        return Err(GatewayError::ApiNotReleased(api_id).with_rid(rid));
    }

    let mut ctx = RequestContext::new(
        rid,
        method,
        params,
        uri.query().unwrap_or_default().to_string(),
        context::cookies(headers),
        context::client_ip(headers, peer),
        debug_on,
        api,
        policies,
    );

    if ctx.debug {
        info!(rid, api_id = %ctx.api.api_id, client_ip = %ctx.client_ip, method = %ctx.method, params = ?ctx.params, "Debug request");
    }

    let result = state.filters.before_route(&mut ctx);
    if !result.is_pass() {
        return Err(result.into_error_response(rid));
    }
    *labels = ApiLabels::from(ctx.api.as_ref());

    match ctx.api.route_type {
        RouteType::Redirect => Ok(redirect(&ctx)),
        RouteType::Sync => match state.dispatcher.sync(&ctx, &state.filters).await {
            Ok(resp) => {
                if ctx.debug {
                    info!(
                        rid,
                        api_id = %ctx.api.api_id,
                        status = resp.status.as_u16(),
                        body = %String::from_utf8_lossy(&resp.body),
                        "Debug response"
                    );
                }

                let mut response = (resp.status, Body::from(resp.body)).into_response();
                if let Some(content_type) = resp.content_type {
                    response.headers_mut().insert(header::CONTENT_TYPE, content_type);
                }
                response.headers_mut().insert("rid", HeaderValue::from(rid));
                Ok(response)
            }
            Err(e) => {
                state.filters.route_failed(&ctx);
                info!(rid, api_id = %ctx.api.api_id, error = %e, "Backend call failed");
                Err(e.with_rid(rid))
            }
        },
    }
}

/// `301` to the backend address with the original query string
fn redirect(ctx: &RequestContext) -> Response {
    let mut location = ctx.api.backend_addr.clone();
    if !ctx.raw_query.is_empty() {
        location.push(if location.contains('?') { '&' } else { '?' });
        location.push_str(&ctx.raw_query);
    }

    if ctx.debug {
        info!(rid = ctx.rid, api_id = %ctx.api.api_id, location = %location, "Debug redirect");
    }

    let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
    match HeaderValue::try_from(location) {
        Ok(value) => {
            response.headers_mut().insert(header::LOCATION, value);
        }
        Err(e) => {
            return GatewayError::Internal(format!("Invalid redirect location: {}", e))
                .with_rid(ctx.rid)
                .into_response();
        }
    }
    response.headers_mut().insert("rid", HeaderValue::from(ctx.rid));
    response
}
