use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use client::{mock::MockRpc, EthRpc};
use collector::TokenClassCache;
use config::ChainSpec;
use metrics::{ChainHealth, MetricsBundle};
use poller::{PollerContext, PollerManager, Reloader, RpcFactory};

use super::*;

struct Fixture {
    state: ApiState,
    manager: Arc<PollerManager>,
    config_path: PathBuf,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.config_path);
    }
}

fn mock_factory() -> RpcFactory {
    let mocks: Arc<Mutex<HashMap<String, Arc<MockRpc>>>> = Arc::new(Mutex::new(HashMap::new()));

    Arc::new(move |spec: &ChainSpec, _scope| {
        let mut mocks = mocks.lock().unwrap();
        let mock = mocks.entry(spec.name.clone()).or_insert_with(|| {
            let mock = Arc::new(MockRpc::new(1));
            mock.set_latest_block(100);
            mock.set_finalized_block(Some(90));
            mock
        });
        mock.clone() as Arc<dyn EthRpc>
    })
}

fn fixture(config_contents: &str) -> Fixture {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

    let config_path = std::env::temp_dir().join(format!(
        "blockchain-exporter-api-test-{}-{}.toml",
        std::process::id(),
        COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
    ));
    std::fs::write(&config_path, config_contents).unwrap();

    let bundle = Arc::new(MetricsBundle::new().unwrap());
    let health = Arc::new(ChainHealth::new(Duration::from_secs(300)));

    let ctx = Arc::new(PollerContext {
        bundle: bundle.clone(),
        health: health.clone(),
        classes: Arc::new(TokenClassCache::new()),
        rpc_factory: mock_factory(),
        pool: None,
        default_poll_interval: Duration::from_millis(20),
        max_failure_backoff: Duration::from_secs(1),
    });

    let manager = Arc::new(PollerManager::new(ctx));
    let reloader = Arc::new(Reloader::new(manager.clone(), config_path.clone()));

    Fixture {
        state: ApiState {
            bundle,
            health,
            reloader,
        },
        manager,
        config_path,
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(router: &Router, uri: &str) -> axum::response::Response {
    router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn health_is_always_ok() {
    let fixture = fixture("");
    let router = health_router(fixture.state.clone());

    let response = get(&router, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["chains"], serde_json::json!([]));
}

#[tokio::test]
async fn livez_is_ok() {
    let fixture = fixture("");
    let router = health_router(fixture.state.clone());

    let response = get(&router, "/health/livez").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn readyz_gates_on_unpolled_chains() {
    let fixture = fixture("");

    // A chain that has not completed its first tick blocks readiness.
    fixture
        .state
        .health
        .register_chain("pending", Duration::from_secs(3600));

    let router = health_router(fixture.state.clone());
    let response = get(&router, "/health/readyz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = body_json(response).await;
    assert_eq!(body["status"], "not_ready");
}

#[tokio::test]
async fn readyz_is_ok_with_empty_configuration() {
    let fixture = fixture("");
    let router = health_router(fixture.state.clone());

    let response = get(&router, "/health/readyz").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn details_include_error_and_backoff() {
    let fixture = fixture("");
    fixture
        .state
        .health
        .register_chain("c1", Duration::from_secs(1));
    fixture
        .state
        .health
        .record_failure("c1", 1_000, "timeout", 3, Duration::from_secs(4));

    let router = health_router(fixture.state.clone());
    let response = get(&router, "/health/details").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let chain = &body["chains"][0];
    assert_eq!(chain["chain"], "c1");
    assert_eq!(chain["status"], "failed");
    assert_eq!(chain["last_error"], "timeout");
    assert_eq!(chain["consecutive_failures"], 3);
    assert_eq!(chain["current_backoff_s"], 4.0);
}

#[tokio::test]
async fn metrics_endpoint_serves_the_registry() {
    let fixture = fixture("");
    fixture.state.bundle.exporter.up.set(1);

    let router = metrics_router(fixture.state.clone());
    let response = get(&router, "/metrics").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; version=0.0.4"
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let payload = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(payload.contains("blockchain_exporter_up 1"));
}

#[tokio::test]
async fn reload_applies_a_valid_configuration() {
    let fixture = fixture(
        r#"
[[blockchains]]
name = "c1"
rpc_url = "https://c1.example.com"
poll_interval = "1s"
"#,
    );

    let router = health_router(fixture.state.clone());
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/health/reload")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = body_json(response).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["added"], 1);
    assert_eq!(body["total"], 1);

    assert_eq!(fixture.manager.chain_names().await, vec!["c1".to_string()]);

    fixture.manager.stop_all(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn invalid_reload_is_rejected_without_disturbing_the_system() {
    let fixture = fixture("this is not toml [");

    let router = health_router(fixture.state.clone());
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/health/reload")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(fixture.manager.chain_names().await.is_empty());
}
