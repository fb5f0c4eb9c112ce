pub mod retry;

use crate::context::RequestContext;
use crate::discovery::ServiceDiscovery;
use crate::error::{GatewayError, Result};
use crate::filter::FilterChain;
use crate::metrics;
use crate::policy::{AddrType, ApiDefinition};
use bytes::Bytes;
use http::{header, HeaderValue, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use retry::RetryExecutor;

/// What the backend answered
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// Sends resolved requests to backends, with admission and retry around each attempt
#[derive(Clone)]
pub struct BackendDispatcher {
    client: reqwest::Client,
    discovery: Arc<dyn ServiceDiscovery>,
}

impl BackendDispatcher {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, discovery })
    }

    /// Backend URL without parameters
    pub fn target_url(&self, api: &ApiDefinition) -> Result<String> {
        match api.addr_type {
            AddrType::Url => Ok(api.backend_addr.clone()),
            AddrType::Discovery => {
                let instance = self.discovery.resolve(&api.backend_addr).ok_or_else(|| {
                    GatewayError::ServiceUnavailable(format!(
                        "no server available for {}",
                        api.backend_addr
                    ))
                })?;
                Ok(format!("http://{}{}", instance, api.backend_uri))
            }
        }
    }

    /// Call the backend of `ctx.api`, retrying transport failures per the
    /// request's retry strategy. An admission refusal stops all attempts.
    pub async fn sync(&self, ctx: &RequestContext, filters: &FilterChain) -> Result<BackendResponse> {
        let base = self.target_url(&ctx.api)?;
        let form = encode_params(ctx);

        let (url, body) = if ctx.api.method == Method::GET {
            (append_query(base, &form), None)
        } else {
            (base, Some(form))
        };

        let retry = ctx.retry_strategy();
        let timeout = retry.req_timeout();
        let executor = RetryExecutor::from_strategy(retry);

        debug!(rid = ctx.rid, url = %url, max_attempts = executor.max_attempts(), "Dispatching to backend");

        let url = url.as_str();
        let body = body.as_deref();
        executor
            .execute_with_predicate(
                move || async move {
                    let admitted = filters.before_call(ctx).await;
                    if !admitted.is_pass() {
                        return Err(GatewayError::TooManyRequests(admitted.message));
                    }

                    let result = self.send_once(ctx, url, body, timeout).await;
                    filters.after_call(ctx).await;

                    match &result {
                        Ok(resp) => metrics::record_backend_code(&ctx.api, resp.status.as_u16()),
                        Err(_) => metrics::record_backend_error(&ctx.api),
                    }
                    result
                },
                GatewayError::is_retryable,
            )
            .await
    }

    async fn send_once(
        &self,
        ctx: &RequestContext,
        url: &str,
        body: Option<&str>,
        timeout: Duration,
    ) -> Result<BackendResponse> {
        let mut req = self
            .client
            .request(ctx.api.method.clone(), url)
            .timeout(timeout)
            .header("rid", ctx.rid.to_string())
            .header("X-Forwarded-For", ctx.client_ip.as_str());

        for cookie in &ctx.cookies {
            req = req.header(header::COOKIE, cookie.as_str());
        }

        if let Some(body) = body {
            req = req
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body.to_string());
        }

        let resp = req.send().await.map_err(backend_error)?;
        let status = resp.status();
        let content_type = resp.headers().get(header::CONTENT_TYPE).cloned();
        let body = resp.bytes().await.map_err(backend_error)?;

        Ok(BackendResponse {
            status,
            content_type,
            body,
        })
    }
}

fn backend_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(format!("Backend request timed out: {}", e))
    } else {
        GatewayError::Backend(format!("Backend request failed: {}", e))
    }
}

/// Request parameters, form encoded
fn encode_params(ctx: &RequestContext) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &ctx.params {
        serializer.append_pair(k, v);
    }
    serializer.finish()
}

fn append_query(mut url: String, query: &str) -> String {
    if query.is_empty() {
        return url;
    }
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(query);
    url
}
