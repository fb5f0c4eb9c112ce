use axum::{body::Body, Router};
use http::{header, Request, StatusCode};
use juz_gateway::{
    config::LimiterConfig,
    context::RidGenerator,
    discovery::StaticDiscovery,
    error::codes,
    filter::FilterChain,
    policy::{
        ApiRecord, CacheScope, PolicyBatch, PolicyCache, StrategyRecord, StrategyStatus,
        StrategyType,
    },
    proxy::BackendDispatcher,
    rate_limit::RateLimiterService,
    router::{build_app, GatewayState},
    rpc::{LimiterLink, RpcServer},
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

/// In-process limiter on an ephemeral port
struct Limiter {
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl Limiter {
    async fn start(strategies: Vec<StrategyRecord>) -> Self {
        Self::start_on("127.0.0.1:0", strategies).await
    }

    async fn start_on(addr: &str, strategies: Vec<StrategyRecord>) -> Self {
        let cache = Arc::new(PolicyCache::new(CacheScope::StrategiesOnly));
        cache.replace(PolicyBatch {
            apis: vec![],
            strategies,
        });

        let service = Arc::new(RateLimiterService::new(cache));
        let server = RpcServer::bind(addr, service).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));

        Self { addr, cancel }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

fn link_config(addr: SocketAddr) -> LimiterConfig {
    LimiterConfig {
        addr: addr.to_string(),
        rpc_timeout_ms: 500,
        ping_interval_secs: 1,
        redial_initial_ms: 100,
        redial_max_ms: 400,
        ..Default::default()
    }
}

fn gateway(apis: Vec<ApiRecord>, strategies: Vec<StrategyRecord>, link: Arc<LimiterLink>) -> Router {
    let cache = Arc::new(PolicyCache::new(CacheScope::Full));
    cache.replace(PolicyBatch { apis, strategies });

    let dispatcher = BackendDispatcher::new(Arc::new(StaticDiscovery::new(HashMap::new()))).unwrap();
    let state = GatewayState::new(
        cache,
        RidGenerator::new(1),
        FilterChain::new(link),
        dispatcher,
        "/service/api",
    );
    build_app(state)
}

fn api(yaml: &str) -> ApiRecord {
    serde_yaml::from_str(yaml).unwrap()
}

fn strategy(id: i64, kind: StrategyType, content: &str) -> StrategyRecord {
    StrategyRecord {
        id,
        name: format!("strategy-{}", id),
        service: "order".to_string(),
        kind,
        sub_type: 0,
        content: content.to_string(),
        status: StrategyStatus::On,
        modify_date: chrono::Utc::now(),
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_end_to_end_passthrough() {
    let limiter = Limiter::start(vec![]).await;
    let link = LimiterLink::connect(&link_config(limiter.addr)).await.unwrap();

    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/order/get"))
        .and(query_param("service_id", "order"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string(r#"{"order":42}"#),
        )
        .expect(1)
        .mount(&backend)
        .await;

    let app = gateway(
        vec![api(&format!(
            "api_id: order.v1\nservice: order\napp: shop\nstatus: released\nbackend_addr: {}/order/get",
            backend.uri()
        ))],
        vec![],
        link.clone(),
    );

    let response = app
        .oneshot(get("/service/api?service_id=order&api_version=1"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    let rid: i64 = response.headers()["rid"].to_str().unwrap().parse().unwrap();
    assert_eq!(rid % 10, 1);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], br#"{"order":42}"#);

    link.shutdown().await;
    limiter.stop();
}

#[tokio::test]
async fn test_unknown_and_offline_apis() {
    let limiter = Limiter::start(vec![]).await;
    let link = LimiterLink::connect(&link_config(limiter.addr)).await.unwrap();
    let app = gateway(vec![api("api_id: order.v1\nstatus: offline")], vec![], link.clone());

    let response = app.clone().oneshot(get("/service/api?service_id=user")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error_code"], codes::API_NOT_EXIST);
    assert!(json["rid"].as_i64().unwrap() > 0);

    let response = app.clone().oneshot(get("/service/api?service_id=order")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error_code"], codes::API_OFFLINE);

    let response = app.oneshot(get("/service/api")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error_code"], codes::PARAM_EMPTY);

    link.shutdown().await;
    limiter.stop();
}

#[tokio::test]
async fn test_limiter_refusal_returns_429() {
    let traffic = strategy(3, StrategyType::Traffic, r#"{"qps":1}"#);
    let limiter = Limiter::start(vec![traffic.clone()]).await;
    let link = LimiterLink::connect(&link_config(limiter.addr)).await.unwrap();

    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&backend)
        .await;

    let app = gateway(
        vec![api(&format!(
            "api_id: order.v1\nstatus: released\ntraffic_strategy: 3\nbackend_addr: {}/x",
            backend.uri()
        ))],
        vec![traffic],
        link.clone(),
    );

    let first = app.clone().oneshot(get("/service/api?service_id=order")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(get("/service/api?service_id=order")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(second).await["error_code"], codes::ACCESS_LIMITED);

    link.shutdown().await;
    limiter.stop();
}

#[tokio::test]
async fn test_fails_open_when_limiter_is_gone() {
    let traffic = strategy(3, StrategyType::Traffic, r#"{"qps":1,"concurrent":1}"#);
    let limiter = Limiter::start(vec![traffic.clone()]).await;
    let link = LimiterLink::connect(&link_config(limiter.addr)).await.unwrap();

    limiter.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(3)
        .mount(&backend)
        .await;

    let app = gateway(
        vec![api(&format!(
            "api_id: order.v1\nstatus: released\ntraffic_strategy: 3\nbackend_addr: {}/x",
            backend.uri()
        ))],
        vec![traffic],
        link.clone(),
    );

    for _ in 0..3 {
        let started = Instant::now();
        let response = app.clone().oneshot(get("/service/api?service_id=order")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    link.shutdown().await;
}

#[tokio::test]
async fn test_redirect_skips_backend_and_admission() {
    let traffic = strategy(3, StrategyType::Traffic, r#"{"qps":1}"#);
    let limiter = Limiter::start(vec![traffic.clone()]).await;
    let link = LimiterLink::connect(&link_config(limiter.addr)).await.unwrap();

    let app = gateway(
        vec![api(
            "api_id: login.v1\nstatus: released\nroute_type: redirect\ntraffic_strategy: 3\nbackend_addr: https://sso.example.com/login",
        )],
        vec![traffic],
        link.clone(),
    );

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(get("/service/api?service_id=login&from=home"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://sso.example.com/login?service_id=login&from=home"
        );
    }

    link.shutdown().await;
    limiter.stop();
}

#[tokio::test]
async fn test_retry_on_backend_timeout() {
    let limiter = Limiter::start(vec![]).await;
    let link = LimiterLink::connect(&link_config(limiter.addr)).await.unwrap();

    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("late")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&backend)
        .await;

    let retry = strategy(
        2,
        StrategyType::Retry,
        r#"{"req_timeout":1,"retry_times":2,"retry_interval":1}"#,
    );
    let app = gateway(
        vec![api(&format!(
            "api_id: order.v1\nstatus: released\nretry_strategy: 2\nbackend_addr: {}/slow",
            backend.uri()
        ))],
        vec![retry],
        link.clone(),
    );

    let started = Instant::now();
    let response = app.oneshot(get("/service/api?service_id=order")).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(response).await["error_code"], codes::REQ_TIMEOUT);
    assert_eq!(backend.received_requests().await.unwrap().len(), 3);

    link.shutdown().await;
    limiter.stop();
}

#[tokio::test]
async fn test_link_redials_after_limiter_restart() {
    let limiter = Limiter::start(vec![]).await;
    let addr = limiter.addr;
    let link = LimiterLink::connect(&link_config(addr)).await.unwrap();
    link.spawn_supervisor();
    assert!(link.is_connected());

    limiter.stop();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!link.is_connected());

    let mut restarted = None;
    for _ in 0..20 {
        if let Ok(server) = RpcServer::bind(
            &addr.to_string(),
            Arc::new(RateLimiterService::new(Arc::new(PolicyCache::new(
                CacheScope::StrategiesOnly,
            )))),
        )
        .await
        {
            restarted = Some(server);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let server = restarted.expect("limiter port should be reusable");
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(cancel.clone()));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !link.is_connected() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(link.is_connected());

    link.shutdown().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_connect_fails_without_limiter() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    assert!(LimiterLink::connect(&link_config(addr)).await.is_err());
}
