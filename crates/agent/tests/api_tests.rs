//! Integration tests for the control surface

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;
use topoguard_agent::api::{create_router, AppState};
use topoguard_lib::{
    discovery::{DependencyGraph, DiscoveryIdentity, IdentityMap, StaticTopology},
    health::{components, HealthRegistry},
    instances::{ClusterClient, InstanceResolver, PodAddress, ServiceRegistry},
    observability::StructuredLogger,
    policy::{PolicyStore, PolicySynthesizer},
    Endpoint, Reconciler, Result, TopologyError,
};
use tower::ServiceExt;

struct MockRegistry;

#[async_trait]
impl ServiceRegistry for MockRegistry {
    async fn instances(&self) -> Result<Vec<Endpoint>> {
        Ok(vec![
            Endpoint::new("orders", "10.0.0.5", Some(8080)),
            Endpoint::new("payments", "10.0.0.9", Some(9090)),
        ])
    }
}

#[derive(Default)]
struct MockCluster {
    applied: Mutex<Vec<String>>,
    reject_all: bool,
    unreachable: bool,
    entered: Option<Arc<Notify>>,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn pod_addresses(&self, _label_key: &str, label: &str) -> Result<Vec<PodAddress>> {
        let pods = match label {
            "k8n-service-discovery" => vec![("10.0.0.1", 8761)],
            "k8n-orders" => vec![("10.0.0.5", 8080), ("10.0.0.6", 8080)],
            "k8n-payments" => vec![("10.0.0.9", 9090)],
            _ => vec![],
        };
        Ok(pods
            .into_iter()
            .map(|(address, port)| PodAddress {
                address: address.to_string(),
                port: Some(port),
            })
            .collect())
    }

    async fn apply_policy(&self, policy: &NetworkPolicy) -> Result<()> {
        let name = policy.metadata.name.clone().unwrap_or_default();
        if self.reject_all {
            return Err(TopologyError::ApplyFailure {
                target: name,
                reason: "forbidden".to_string(),
            });
        }
        self.applied.lock().unwrap().push(name);
        Ok(())
    }

    async fn delete_all_policies(&self) -> Result<()> {
        if self.unreachable {
            return Err(TopologyError::Cluster("connection refused".to_string()));
        }
        if let (Some(entered), Some(gate)) = (&self.entered, &self.gate) {
            entered.notify_one();
            gate.notified().await;
        }
        Ok(())
    }

    async fn list_policies(&self) -> Result<Vec<String>> {
        Ok(self.applied.lock().unwrap().clone())
    }
}

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    cluster: Arc<MockCluster>,
    _dir: TempDir,
}

async fn setup_test_app_with(cluster: MockCluster) -> TestApp {
    let mut identity = IdentityMap::new();
    identity.insert("orders", "k8n-orders");
    identity.insert("payments", "k8n-payments");
    identity.alias("k8n-service-discovery", "containerized-discovery");
    let graph = DependencyGraph::from_edges(
        DiscoveryIdentity::default(),
        [("k8n-orders", "k8n-payments")],
    );

    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(cluster);
    let resolver = InstanceResolver::new(
        Arc::new(MockRegistry),
        cluster.clone(),
        "app",
        StructuredLogger::new("test"),
    );
    let reconciler = Reconciler::new(
        Arc::new(StaticTopology { identity, graph }),
        resolver,
        PolicySynthesizer::default(),
        PolicyStore::new(dir.path().join("network_policies")),
        cluster.clone(),
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let state = Arc::new(AppState::new(Arc::new(reconciler), health_registry));
    let router = create_router(state.clone());

    TestApp {
        router,
        state,
        cluster,
        _dir: dir,
    }
}

async fn setup_test_app() -> TestApp {
    setup_test_app_with(MockCluster::default()).await
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn test_apply_returns_cycle_report() {
    let app = setup_test_app().await;

    let response = app.router.oneshot(post("/apply")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["kind"], "apply");
    assert_eq!(report["state"], "enforced");
    assert_eq!(report["source"], "registry");
    assert_eq!(report["generated"].as_array().unwrap().len(), 3);
    assert_eq!(
        report["skipped"][0],
        "10.0.0.1-8761-containerized-discovery-policy"
    );
    assert_eq!(app.cluster.applied.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_apply_with_cluster_source() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(post("/apply?source=cluster"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["source"], "cluster");
    // two orders pods, one payments pod, one discovery pod
    assert_eq!(report["generated"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_apply_dry_run_does_not_enforce() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(post("/apply?dry_run=true"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["state"], "synthesized");
    assert_eq!(report["dry_run"], true);
    assert!(app.cluster.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_apply_partial_failure_returns_207() {
    let app = setup_test_app_with(MockCluster {
        reject_all: true,
        ..Default::default()
    })
    .await;

    let response = app.router.oneshot(post("/apply")).await.unwrap();

    assert_eq!(response.status(), StatusCode::MULTI_STATUS);
    let report = body_json(response).await;
    assert_eq!(report["failed"].as_array().unwrap().len(), 2);
    assert_eq!(report["unpolicied"].as_array().unwrap().len(), 2);

    let health = app.state.health_registry.health().await;
    assert_eq!(
        health.components[components::RECONCILER].status,
        topoguard_lib::ComponentStatus::Degraded
    );
}

#[tokio::test]
async fn test_apply_cluster_unreachable_returns_500() {
    let app = setup_test_app_with(MockCluster {
        unreachable: true,
        ..Default::default()
    })
    .await;

    let response = app.router.clone().oneshot(post("/apply")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("connection refused"));

    let health = app.router.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_apply_rejects_unknown_source() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(post("/apply?source=consul"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_overlapping_apply_returns_409() {
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let app = setup_test_app_with(MockCluster {
        entered: Some(entered.clone()),
        gate: Some(gate.clone()),
        ..Default::default()
    })
    .await;

    let first = tokio::spawn(app.router.clone().oneshot(post("/apply")));
    entered.notified().await;

    let second = app.router.clone().oneshot(post("/delete")).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);

    let status = body_json(app.router.clone().oneshot(get("/status")).await.unwrap()).await;
    assert_eq!(status["cycle_in_progress"], true);

    gate.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_disconnected_apply_still_finishes() {
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let app = setup_test_app_with(MockCluster {
        entered: Some(entered.clone()),
        gate: Some(gate.clone()),
        ..Default::default()
    })
    .await;

    let request = tokio::spawn(app.router.clone().oneshot(post("/apply")));
    entered.notified().await;
    request.abort();
    let _ = request.await;
    gate.notify_one();

    let status = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let status =
                body_json(app.router.clone().oneshot(get("/status")).await.unwrap()).await;
            if status["cycle_in_progress"] == false {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(status["state"], "enforced");
    assert_eq!(status["last_cycle"]["kind"], "apply");
    assert_eq!(app.cluster.applied.lock().unwrap().len(), 2);

    let cancel = body_json(app.router.oneshot(post("/cancel")).await.unwrap()).await;
    assert_eq!(cancel["cancelled"], false);
}

#[tokio::test]
async fn test_delete_and_status() {
    let app = setup_test_app().await;

    let response = app.router.clone().oneshot(post("/apply")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.router.clone().oneshot(post("/delete")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["kind"], "delete");
    assert_eq!(report["state"], "cleared");

    let status = body_json(app.router.oneshot(get("/status")).await.unwrap()).await;
    assert_eq!(status["state"], "cleared");
    assert_eq!(status["cycle_in_progress"], false);
    assert_eq!(status["last_cycle"]["kind"], "delete");
}

#[tokio::test]
async fn test_enforced_policies() {
    let app = setup_test_app().await;

    let _ = app.router.clone().oneshot(post("/apply")).await.unwrap();

    let response = app.router.oneshot(get("/policies")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["namespace"], "default");
    assert_eq!(
        body["policies"],
        serde_json::json!(["10.0.0.5-8080-orders-policy", "10.0.0.9-9090-payments-policy"])
    );
}

#[tokio::test]
async fn test_cancel_without_cycle() {
    let app = setup_test_app().await;

    let response = app.router.oneshot(post("/cancel")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["cancelled"], false);
}

#[tokio::test]
async fn test_service_graph_json_and_dot() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(get("/graph/services"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let view = body_json(response).await;
    assert_eq!(view["discovery"]["label"], "k8n-service-discovery");
    assert_eq!(view["nodes"].as_array().unwrap().len(), 3);
    assert!(view["edges"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["from"] == "k8n-orders" && e["to"] == "k8n-payments"));

    let response = app
        .router
        .oneshot(get("/graph/services?format=dot"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/vnd.graphviz; charset=utf-8"
    );
    assert!(body_text(response).await.contains("\"k8n-orders\" -> \"k8n-payments\";"));
}

#[tokio::test]
async fn test_endpoint_graph_cluster_source_has_counts() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(get("/graph/endpoints?source=cluster"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let view = body_json(response).await;
    assert_eq!(view["source"], "cluster");
    assert_eq!(view["instance_counts"]["k8n-orders"], 2);
    assert!(view["edges"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["from"] == "10.0.0.6:8080 - orders" && e["to"] == "10.0.0.9:9090 - payments"));
}

#[tokio::test]
async fn test_healthz_and_readyz() {
    let app = setup_test_app().await;

    let response = app.router.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");

    let response = app.router.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    app.state.health_registry.set_ready(true).await;
    let response = app.router.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup_test_app().await;

    // Populate at least one cycle metric
    let _ = app.router.clone().oneshot(post("/apply")).await.unwrap();

    let response = app.router.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_text(response).await;
    assert!(body.contains("topoguard_reconcile_duration_seconds"));
    assert!(body.contains("topoguard_policies_generated"));
}
