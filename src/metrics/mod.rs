use crate::error::{GatewayError, Result};
use crate::policy::ApiDefinition;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub const REQUEST_DURATION: &str = "juz_request_duration_ms";
pub const REQUEST_LIMITED: &str = "juz_request_limited_total";
pub const BACKEND_ERRORS: &str = "juz_backend_errors_total";
pub const BACKEND_RESPONSES: &str = "juz_backend_responses_total";

/// Label values used when a request never resolved to an API
pub const UNKNOWN_LABEL: &str = "error";

/// Metrics service exposing the Prometheus exporter
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_histogram!(
            REQUEST_DURATION,
            metrics::Unit::Milliseconds,
            "Gateway request latency, one sample per client request"
        );
        describe_counter!(
            REQUEST_LIMITED,
            "Requests blocked by black/white lists or refused by admission control"
        );
        describe_counter!(BACKEND_ERRORS, "Backend attempts that failed to get a response");
        describe_counter!(
            BACKEND_RESPONSES,
            "Backend responses by HTTP status code"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Standalone `/metrics` app
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.clone())
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}

/// `api_id`, `service` and `app` labels of one API
#[derive(Debug, Clone)]
pub struct ApiLabels {
    pub api_id: String,
    pub service: String,
    pub app: String,
}

impl ApiLabels {
    pub fn unknown() -> Self {
        Self {
            api_id: UNKNOWN_LABEL.to_string(),
            service: UNKNOWN_LABEL.to_string(),
            app: UNKNOWN_LABEL.to_string(),
        }
    }

    fn as_pairs(&self) -> [(&'static str, String); 3] {
        [
            ("api_id", self.api_id.clone()),
            ("service", self.service.clone()),
            ("app", self.app.clone()),
        ]
    }
}

impl From<&ApiDefinition> for ApiLabels {
    fn from(api: &ApiDefinition) -> Self {
        Self {
            api_id: api.api_id.clone(),
            service: api.service.clone(),
            app: api.app.clone(),
        }
    }
}

/// Record the latency of one client request
pub fn record_request_latency(labels: &ApiLabels, duration_ms: f64) {
    histogram!(REQUEST_DURATION, &labels.as_pairs()).record(duration_ms);
}

/// Record a request blocked by BW list or refused by admission
pub fn record_limited(api: &ApiDefinition) {
    counter!(REQUEST_LIMITED, &ApiLabels::from(api).as_pairs()).increment(1);
}

/// Record a backend attempt that got no response
pub fn record_backend_error(api: &ApiDefinition) {
    counter!(BACKEND_ERRORS, &ApiLabels::from(api).as_pairs()).increment(1);
}

/// Record a backend response status
pub fn record_backend_code(api: &ApiDefinition, code: u16) {
    let labels = ApiLabels::from(api);
    let labels = [
        ("code", code.to_string()),
        ("api_id", labels.api_id),
        ("service", labels.service),
        ("app", labels.app),
    ];
    counter!(BACKEND_RESPONSES, &labels).increment(1);
}

/// Measures one client request; records exactly once when consumed
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn record(self, labels: &ApiLabels) {
        record_request_latency(labels, self.elapsed_ms());
    }
}
