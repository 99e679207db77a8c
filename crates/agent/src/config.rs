//! Agent configuration
//!
//! Read once at startup from an optional file named by `TOPOGUARD_CONFIG`,
//! overlaid by `TOPOGUARD_*` environment variables. Never reloaded.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use topoguard_lib::{
    discovery::graph::{DEFAULT_DISCOVERY_LABEL, DEFAULT_DISCOVERY_SERVICE},
    instances::registry::DEFAULT_REGISTRY_URL,
    policy::{parse_selector, SynthesizerConfig},
    InstanceSource, TopologyError,
};

/// Scheduler backend used for pod lookups and policy submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBackend {
    /// Kubernetes API through the ambient kubeconfig
    #[default]
    Kube,
    /// The `kubectl` binary
    Kubectl,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Namespace the policies are enforced in
    pub namespace: String,

    /// Root of the service source tree holding deployment manifests
    pub root_dir: PathBuf,

    /// Directory of packaged artifact archives
    pub archive_dir: PathBuf,

    /// Decompiler used by the extraction step
    pub decompiler_path: PathBuf,

    /// Extraction output, one subdirectory per archive
    pub work_dir: PathBuf,

    /// Where synthesized policy documents are written
    pub policy_dir: Option<PathBuf>,

    pub registry_url: String,
    pub registry_timeout_secs: u64,

    pub discovery_label: String,
    pub discovery_service: String,

    /// Deployment label naming a workload, e.g. `app`
    pub workload_label_key: String,

    /// Pod label carrying the pod address, e.g. `ip`
    pub address_label_key: String,

    pub service_cidr: String,
    pub dns_namespace: String,
    pub dns_selector: String,

    /// Default instance source for apply requests
    pub instance_source: InstanceSource,

    pub cluster_backend: ClusterBackend,
    pub kubectl_path: PathBuf,

    /// Concurrent artifact scans and pod queries
    pub scan_concurrency: usize,

    /// Control surface port
    pub api_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            root_dir: PathBuf::from("."),
            archive_dir: PathBuf::from("images"),
            decompiler_path: PathBuf::from("cfr.jar"),
            work_dir: PathBuf::from("output"),
            policy_dir: None,
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            registry_timeout_secs: 10,
            discovery_label: DEFAULT_DISCOVERY_LABEL.to_string(),
            discovery_service: DEFAULT_DISCOVERY_SERVICE.to_string(),
            workload_label_key: "app".to_string(),
            address_label_key: "ip".to_string(),
            service_cidr: "10.152.183.0/24".to_string(),
            dns_namespace: "kube-system".to_string(),
            dns_selector: "k8s-app=kube-dns".to_string(),
            instance_source: InstanceSource::Registry,
            cluster_backend: ClusterBackend::Kube,
            kubectl_path: PathBuf::from("kubectl"),
            scan_concurrency: 8,
            api_port: 8080,
        }
    }
}

impl AgentConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("TOPOGUARD_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("TOPOGUARD"))
            .build()
            .context("failed to read configuration")?;

        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        config
            .try_deserialize()
            .context("invalid configuration")
    }

    /// Both artifact inputs must exist before discovery starts
    pub fn validate(&self) -> Result<(), TopologyError> {
        for path in [&self.archive_dir, &self.decompiler_path] {
            if !path.exists() {
                return Err(TopologyError::MissingArtifact { path: path.clone() });
            }
        }
        Ok(())
    }

    pub fn policy_dir(&self) -> PathBuf {
        self.policy_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("network_policies"))
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }

    pub fn synthesizer_config(&self) -> Result<SynthesizerConfig> {
        let dns_selector = parse_selector(&self.dns_selector).context("invalid dns_selector")?;
        Ok(SynthesizerConfig {
            namespace: self.namespace.clone(),
            address_label_key: self.address_label_key.clone(),
            service_cidr: self.service_cidr.clone(),
            dns_namespace: self.dns_namespace.clone(),
            dns_selector,
        })
    }
}
