//! Cluster scheduler access
//!
//! Two backends share one trait: the Kubernetes API through `kube`, and the
//! `kubectl` binary for environments where only the CLI is configured.

use crate::error::{Result, TopologyError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "topoguard";

/// A running pod's address and first declared container port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodAddress {
    pub address: String,
    pub port: Option<u16>,
}

/// Namespaced view of the scheduler
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Running pods carrying `label_key=label`
    async fn pod_addresses(&self, label_key: &str, label: &str) -> Result<Vec<PodAddress>>;

    /// Create or replace one policy object
    async fn apply_policy(&self, policy: &NetworkPolicy) -> Result<()>;

    /// Remove every policy object in the namespace
    async fn delete_all_policies(&self) -> Result<()>;

    /// Names of the policy objects currently in the namespace
    async fn list_policies(&self) -> Result<Vec<String>>;
}

/// Extract the pod address and first container's first port
///
/// Pods without an assigned address (pending, terminating) yield `None`.
pub fn pod_address(pod: &Pod) -> Option<PodAddress> {
    let address = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())?;

    let port = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|p| u16::try_from(p.container_port).ok());

    Some(PodAddress {
        address: address.to_string(),
        port,
    })
}

fn policy_name(policy: &NetworkPolicy) -> String {
    policy.metadata.name.clone().unwrap_or_default()
}

/// Backend talking to the API server directly
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Build a client from the ambient kubeconfig or in-cluster service account
    pub async fn try_default(namespace: impl Into<String>) -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| TopologyError::Cluster(e.to_string()))?;
        Ok(Self::new(client, namespace))
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn policies(&self) -> Api<NetworkPolicy> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn pod_addresses(&self, label_key: &str, label: &str) -> Result<Vec<PodAddress>> {
        let selector = format!("{}={}", label_key, label);
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| TopologyError::Cluster(format!("list pods {}: {}", selector, e)))?;

        let addresses: Vec<PodAddress> = pods.items.iter().filter_map(pod_address).collect();
        debug!(
            selector = %selector,
            pods = pods.items.len(),
            addresses = addresses.len(),
            "Listed pods"
        );
        Ok(addresses)
    }

    async fn apply_policy(&self, policy: &NetworkPolicy) -> Result<()> {
        let name = policy_name(policy);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.policies()
            .patch(&name, &params, &Patch::Apply(policy))
            .await
            .map_err(|e| TopologyError::ApplyFailure {
                target: name.clone(),
                reason: e.to_string(),
            })?;
        debug!(policy = %name, "Applied network policy");
        Ok(())
    }

    async fn delete_all_policies(&self) -> Result<()> {
        self.policies()
            .delete_collection(&DeleteParams::default(), &ListParams::default())
            .await
            .map_err(|e| TopologyError::Cluster(format!("delete network policies: {}", e)))?;
        info!(namespace = %self.namespace, "Deleted all network policies");
        Ok(())
    }

    async fn list_policies(&self) -> Result<Vec<String>> {
        let list = self
            .policies()
            .list(&ListParams::default())
            .await
            .map_err(|e| TopologyError::Cluster(format!("list network policies: {}", e)))?;
        Ok(list.items.iter().map(policy_name).collect())
    }
}

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// Backend shelling out to the `kubectl` binary
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: PathBuf,
    namespace: String,
}

impl Kubectl {
    pub fn new(binary: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            namespace: namespace.into(),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .arg("-n")
            .arg(&self.namespace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            TopologyError::Cluster(format!("failed to run {}: {}", self.binary.display(), e))
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .map_err(|e| TopologyError::Cluster(format!("kubectl stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TopologyError::Cluster(format!("kubectl: {}", e)))?;

        if !output.status.success() {
            return Err(TopologyError::Cluster(format!(
                "kubectl {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ClusterClient for Kubectl {
    async fn pod_addresses(&self, label_key: &str, label: &str) -> Result<Vec<PodAddress>> {
        let selector = format!("{}={}", label_key, label);
        let stdout = self
            .run(&["get", "pods", "-l", &selector, "-o", "json"], None)
            .await?;
        let pods: ItemList<Pod> =
            serde_json::from_slice(&stdout).map_err(|e| TopologyError::parse("pod list", e))?;
        Ok(pods.items.iter().filter_map(pod_address).collect())
    }

    async fn apply_policy(&self, policy: &NetworkPolicy) -> Result<()> {
        let name = policy_name(policy);
        let document = serde_yaml::to_string(policy)?;
        self.run(&["apply", "-f", "-"], Some(document.as_bytes()))
            .await
            .map_err(|e| TopologyError::ApplyFailure {
                target: name,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn delete_all_policies(&self) -> Result<()> {
        self.run(&["delete", "networkpolicies", "--all"], None).await?;
        info!(namespace = %self.namespace, "Deleted all network policies");
        Ok(())
    }

    async fn list_policies(&self) -> Result<Vec<String>> {
        let stdout = self
            .run(&["get", "networkpolicies", "-o", "json"], None)
            .await?;
        let policies: ItemList<NetworkPolicy> = serde_json::from_slice(&stdout)
            .map_err(|e| TopologyError::parse("network policy list", e))?;
        Ok(policies.items.iter().map(policy_name).collect())
    }
}
