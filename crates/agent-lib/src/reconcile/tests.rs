use super::*;
use crate::discovery::{DependencyGraph, DiscoveryIdentity, IdentityMap};
use crate::instances::{PodAddress, ServiceRegistry};
use crate::models::Endpoint;
use crate::policy::SynthesizerConfig;
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

const DISCOVERY_POLICY: &str = "10.0.0.1-8761-containerized-discovery-policy";
const ORDERS_POLICY: &str = "10.0.0.5-8080-orders-policy";
const PAYMENTS_POLICY: &str = "10.0.0.9-9090-payments-policy";

struct MockRegistry;

#[async_trait]
impl ServiceRegistry for MockRegistry {
    async fn instances(&self) -> Result<Vec<Endpoint>> {
        Ok(vec![
            Endpoint::new("ORDERS", "10.0.0.5", Some(8080)),
            Endpoint::new("PAYMENTS", "10.0.0.9", Some(9090)),
        ])
    }
}

#[derive(Default)]
struct MockCluster {
    applied: StdMutex<Vec<String>>,
    deletes: StdMutex<usize>,
    reject: Option<String>,
    /// Cancelled after the first successful apply
    cancel_after_first: Option<CancellationToken>,
    /// Signalled on delete; the delete then waits on `gate`
    entered: Option<Arc<Notify>>,
    gate: Option<Arc<Notify>>,
    /// Every delete after the first fails
    fail_rollback: bool,
}

impl MockCluster {
    fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    fn deletes(&self) -> usize {
        *self.deletes.lock().unwrap()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn pod_addresses(&self, _label_key: &str, label: &str) -> Result<Vec<PodAddress>> {
        if label == "k8n-service-discovery" {
            Ok(vec![PodAddress {
                address: "10.0.0.1".to_string(),
                port: Some(8761),
            }])
        } else {
            Ok(Vec::new())
        }
    }

    async fn apply_policy(&self, policy: &NetworkPolicy) -> Result<()> {
        let name = policy.metadata.name.clone().unwrap_or_default();
        if self.reject.as_deref() == Some(name.as_str()) {
            return Err(TopologyError::ApplyFailure {
                target: name,
                reason: "admission webhook denied the request".to_string(),
            });
        }
        self.applied.lock().unwrap().push(name);
        if let Some(token) = &self.cancel_after_first {
            token.cancel();
        }
        Ok(())
    }

    async fn delete_all_policies(&self) -> Result<()> {
        if let (Some(entered), Some(gate)) = (&self.entered, &self.gate) {
            entered.notify_one();
            gate.notified().await;
        }
        let mut deletes = self.deletes.lock().unwrap();
        if self.fail_rollback && *deletes > 0 {
            return Err(TopologyError::Cluster("connection reset by peer".to_string()));
        }
        *deletes += 1;
        Ok(())
    }

    async fn list_policies(&self) -> Result<Vec<String>> {
        Ok(self.applied())
    }
}

fn topology() -> Arc<StaticTopology> {
    let mut identity = IdentityMap::new();
    identity.insert("orders", "k8n-orders");
    identity.insert("payments", "k8n-payments");
    identity.alias("k8n-service-discovery", "containerized-discovery");

    let graph = DependencyGraph::from_edges(
        DiscoveryIdentity::default(),
        [("k8n-orders", "k8n-payments")],
    );
    Arc::new(StaticTopology { identity, graph })
}

fn reconciler(cluster: Arc<MockCluster>, dir: &TempDir) -> Arc<Reconciler> {
    let logger = StructuredLogger::new("shop");
    let resolver = InstanceResolver::new(Arc::new(MockRegistry), cluster.clone(), "app", logger);
    let synthesizer = PolicySynthesizer::new(SynthesizerConfig {
        namespace: "shop".to_string(),
        ..Default::default()
    });
    Arc::new(Reconciler::new(
        topology(),
        resolver,
        synthesizer,
        PolicyStore::new(dir.path().join("network_policies")),
        cluster,
    ))
}

fn gated_cluster() -> (Arc<MockCluster>, Arc<Notify>, Arc<Notify>) {
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let cluster = Arc::new(MockCluster {
        entered: Some(entered.clone()),
        gate: Some(gate.clone()),
        ..Default::default()
    });
    (cluster, entered, gate)
}

async fn wait_until_idle(reconciler: &Reconciler) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while reconciler.status().await.cycle_in_progress {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cycle did not finish");
}

#[tokio::test]
async fn test_apply_enforces_everything_but_discovery() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::default());
    let reconciler = reconciler(cluster.clone(), &dir);

    let report = reconciler.apply(ApplyOptions::default()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.state, ReconcileState::Enforced);
    assert_eq!(reconciler.state().await, ReconcileState::Enforced);
    assert_eq!(report.generated, vec![DISCOVERY_POLICY, ORDERS_POLICY, PAYMENTS_POLICY]);
    assert_eq!(report.skipped, vec![DISCOVERY_POLICY]);
    assert_eq!(cluster.applied(), vec![ORDERS_POLICY, PAYMENTS_POLICY]);
    assert_eq!(cluster.deletes(), 1);

    // the discovery document is still written to disk
    let files = PolicyStore::new(dir.path().join("network_policies")).list().unwrap();
    assert_eq!(files.len(), 3);
}

#[tokio::test]
async fn test_dry_run_stops_at_synthesized() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::default());
    let reconciler = reconciler(cluster.clone(), &dir);

    let report = reconciler
        .apply(ApplyOptions {
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(report.state, ReconcileState::Synthesized);
    assert_eq!(report.generated.len(), 3);
    assert!(cluster.applied().is_empty());
    assert_eq!(cluster.deletes(), 0);
    assert_eq!(reconciler.state().await, ReconcileState::Cleared);
}

#[tokio::test]
async fn test_apply_failure_is_isolated_per_document() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster {
        reject: Some(ORDERS_POLICY.to_string()),
        ..Default::default()
    });
    let reconciler = reconciler(cluster.clone(), &dir);

    let report = reconciler.apply(ApplyOptions::default()).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.state, ReconcileState::Enforced);
    assert_eq!(cluster.applied(), vec![PAYMENTS_POLICY]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].target, ORDERS_POLICY);
    assert_eq!(report.unpolicied, vec![ORDERS_POLICY]);
}

#[tokio::test]
async fn test_cancel_rolls_back_to_cleared() {
    let dir = TempDir::new().unwrap();
    let parent = CancellationToken::new();
    let cluster = Arc::new(MockCluster {
        cancel_after_first: Some(parent.clone()),
        ..Default::default()
    });
    let reconciler = reconciler(cluster.clone(), &dir);

    let report = reconciler
        .apply_until(ApplyOptions::default(), parent)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.state, ReconcileState::Cleared);
    assert_eq!(reconciler.state().await, ReconcileState::Cleared);
    assert_eq!(cluster.applied(), vec![ORDERS_POLICY]);
    // initial clear plus rollback
    assert_eq!(cluster.deletes(), 2);
    assert_eq!(report.unpolicied, vec![ORDERS_POLICY, PAYMENTS_POLICY]);
    assert!(report.applied.is_empty());
}

#[tokio::test]
async fn test_overlapping_trigger_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (cluster, entered, gate) = gated_cluster();
    let reconciler = reconciler(cluster, &dir);

    let running = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { reconciler.apply(ApplyOptions::default()).await })
    };
    entered.notified().await;

    assert!(reconciler.status().await.cycle_in_progress);
    assert!(matches!(
        reconciler.delete().await,
        Err(TopologyError::CycleInProgress)
    ));
    assert!(matches!(
        reconciler.apply(ApplyOptions::default()).await,
        Err(TopologyError::CycleInProgress)
    ));

    gate.notify_one();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.state, ReconcileState::Enforced);
}

#[tokio::test]
async fn test_delete_returns_to_cleared() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::default());
    let reconciler = reconciler(cluster.clone(), &dir);

    reconciler.apply(ApplyOptions::default()).await.unwrap();
    let report = reconciler.delete().await.unwrap();

    assert_eq!(report.kind, CycleKind::Delete);
    assert_eq!(reconciler.state().await, ReconcileState::Cleared);
    assert_eq!(cluster.deletes(), 2);
    assert!(PolicyStore::new(dir.path().join("network_policies"))
        .list()
        .unwrap()
        .is_empty());

    let status = reconciler.status().await;
    assert!(!status.cycle_in_progress);
    assert_eq!(status.last_cycle.unwrap().kind, CycleKind::Delete);
}

#[tokio::test]
async fn test_cancel_without_cycle() {
    let dir = TempDir::new().unwrap();
    let reconciler = reconciler(Arc::new(MockCluster::default()), &dir);
    assert!(!reconciler.cancel().await);
}

#[tokio::test]
async fn test_failed_rollback_is_reported() {
    let dir = TempDir::new().unwrap();
    let parent = CancellationToken::new();
    let cluster = Arc::new(MockCluster {
        cancel_after_first: Some(parent.clone()),
        fail_rollback: true,
        ..Default::default()
    });
    let reconciler = reconciler(cluster.clone(), &dir);

    let report = reconciler
        .apply_until(ApplyOptions::default(), parent)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(!report.is_success());
    assert!(report
        .rollback_error
        .as_deref()
        .unwrap()
        .contains("connection reset"));
    // the orders policy is still in the cluster
    assert_eq!(report.applied, vec![ORDERS_POLICY]);
    assert_eq!(report.unpolicied, vec![PAYMENTS_POLICY]);
    assert_eq!(report.state, ReconcileState::Enforced);
    assert_eq!(reconciler.state().await, ReconcileState::Enforced);

    let status = reconciler.status().await;
    assert!(!status.cycle_in_progress);
    assert!(status.last_cycle.unwrap().rollback_error.is_some());
}

#[tokio::test]
async fn test_dropped_caller_does_not_strand_the_cycle() {
    let dir = TempDir::new().unwrap();
    let (cluster, entered, gate) = gated_cluster();
    let reconciler = reconciler(cluster.clone(), &dir);

    let caller = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { reconciler.apply(ApplyOptions::default()).await })
    };
    entered.notified().await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    // the cycle keeps running without its caller
    assert!(reconciler.status().await.cycle_in_progress);
    gate.notify_one();
    wait_until_idle(&reconciler).await;

    assert!(!reconciler.cancel().await);
    assert_eq!(reconciler.state().await, ReconcileState::Enforced);
    assert_eq!(cluster.applied(), vec![ORDERS_POLICY, PAYMENTS_POLICY]);
    let last = reconciler.status().await.last_cycle.unwrap();
    assert_eq!(last.state, ReconcileState::Enforced);

    // the slot is free for the next trigger
    gate.notify_one();
    assert!(reconciler.delete().await.is_ok());
}

#[tokio::test]
async fn test_cancel_is_refused_during_delete() {
    let dir = TempDir::new().unwrap();
    let (cluster, entered, gate) = gated_cluster();
    let reconciler = reconciler(cluster.clone(), &dir);

    let running = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { reconciler.delete().await })
    };
    entered.notified().await;

    assert!(reconciler.status().await.cycle_in_progress);
    assert!(!reconciler.cancel().await);

    gate.notify_one();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.kind, CycleKind::Delete);
    assert_eq!(cluster.deletes(), 1);
    assert_eq!(reconciler.state().await, ReconcileState::Cleared);
}
