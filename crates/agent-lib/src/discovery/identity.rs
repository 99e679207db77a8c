//! Service name <-> workload label mapping
//!
//! A service declares its name in its configuration document and its cluster
//! workload label in the deployment manifest shipped next to it. Both
//! directions are kept so that graph edges (labels) can be turned back into
//! registry names (services) and vice versa.

use super::artifacts::{
    walk_files, ConfigDocument, DeploymentManifest, CONFIG_FILE_NAME, DEPLOYMENT_FILE_NAME,
};
use crate::error::{Result, TopologyError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bidirectional service/label lookup tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentityMap {
    service_to_label: BTreeMap<String, String>,
    label_to_service: BTreeMap<String, String>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping. The first mapping for a service or label wins;
    /// returns false when the pair was ignored.
    pub fn insert(&mut self, service: &str, label: &str) -> bool {
        let service = service.to_lowercase();

        if let Some(existing) = self.service_to_label.get(&service) {
            if existing != label {
                warn!(
                    service = %service,
                    existing_label = %existing,
                    ignored_label = %label,
                    "Conflicting workload label for service, keeping the first"
                );
            }
            return false;
        }
        if let Some(existing) = self.label_to_service.get(label) {
            warn!(
                label = %label,
                existing_service = %existing,
                ignored_service = %service,
                "Workload label already mapped to another service, keeping the first"
            );
            return false;
        }

        self.service_to_label.insert(service.clone(), label.to_string());
        self.label_to_service.insert(label.to_string(), service);
        true
    }

    /// Point `label` at `service` even if the service already has a label.
    /// Used for the reserved discovery node.
    pub fn alias(&mut self, label: &str, service: &str) {
        let service = service.to_lowercase();
        self.service_to_label
            .entry(service.clone())
            .or_insert_with(|| label.to_string());
        self.label_to_service.insert(label.to_string(), service);
    }

    pub fn label_for(&self, service: &str) -> Option<&str> {
        self.service_to_label
            .get(&service.to_lowercase())
            .map(String::as_str)
    }

    pub fn service_for(&self, label: &str) -> Option<&str> {
        self.label_to_service.get(label).map(String::as_str)
    }

    /// Typed lookup used by the graph builder
    pub fn resolve_label(&self, referrer: &str, service: &str) -> Result<&str> {
        self.label_for(service)
            .ok_or_else(|| TopologyError::UnresolvedIdentity {
                referrer: referrer.to_string(),
                reference: service.to_string(),
            })
    }

    /// Workload labels known to the mapping, sorted
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.label_to_service.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.label_to_service.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_to_service.is_empty()
    }
}

/// One directory holding both a deployment manifest and a service configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPair {
    pub deployment: PathBuf,
    pub config: PathBuf,
}

/// Builds the identity mapping by walking the service source tree
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    root: PathBuf,
    label_key: String,
}

impl IdentityResolver {
    pub fn new(root: impl Into<PathBuf>, label_key: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            label_key: label_key.into(),
        }
    }

    /// Locate every directory carrying `k8s/deployment.yml` and a
    /// `src/main/**/resources/application.yml`
    pub fn find_pairs(&self) -> Result<Vec<ManifestPair>> {
        let mut pairs = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            if let Some(pair) = Self::pair_in(&dir)? {
                pairs.push(pair);
            }

            let entries = std::fs::read_dir(&dir).map_err(|e| TopologyError::io(&dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| TopologyError::io(&dir, e))?;
                let file_type = entry
                    .file_type()
                    .map_err(|e| TopologyError::io(entry.path(), e))?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                }
            }
        }

        pairs.sort_by(|a, b| a.deployment.cmp(&b.deployment));
        Ok(pairs)
    }

    fn pair_in(dir: &Path) -> Result<Option<ManifestPair>> {
        let deployment = dir.join("k8s").join(DEPLOYMENT_FILE_NAME);
        if !deployment.is_file() {
            return Ok(None);
        }

        let config = walk_files(&dir.join("src").join("main"))?
            .into_iter()
            .filter(|p| p.file_name().is_some_and(|n| n == CONFIG_FILE_NAME))
            .find(|p| {
                p.parent()
                    .is_some_and(|parent| parent.to_string_lossy().contains("resources"))
            });

        Ok(config.map(|config| ManifestPair { deployment, config }))
    }

    /// Extract (service, label) from one pair; `None` when either side is blank
    pub fn read_pair(&self, pair: &ManifestPair) -> Result<Option<(String, String)>> {
        let config_text = std::fs::read_to_string(&pair.config)
            .map_err(|e| TopologyError::io(&pair.config, e))?;
        let deployment_text = std::fs::read_to_string(&pair.deployment)
            .map_err(|e| TopologyError::io(&pair.deployment, e))?;

        let service = ConfigDocument::parse(&config_text)?.service_name();
        let label = DeploymentManifest::parse(&deployment_text)?.workload_label(&self.label_key);

        Ok(service.zip(label))
    }

    /// Walk the tree and build the mapping. Unreadable pairs are logged and skipped.
    pub fn resolve(&self) -> Result<IdentityMap> {
        let mut identity = IdentityMap::new();

        for pair in self.find_pairs()? {
            match self.read_pair(&pair) {
                Ok(Some((service, label))) => {
                    debug!(service = %service, label = %label, "Mapped service to workload label");
                    identity.insert(&service, &label);
                }
                Ok(None) => {
                    debug!(
                        path = %pair.deployment.display(),
                        "Service name or workload label missing"
                    );
                }
                Err(e) => {
                    warn!(
                        path = %pair.deployment.display(),
                        error = %e,
                        "Failed to read manifest pair"
                    );
                }
            }
        }

        info!(services = identity.len(), "Identity mapping built");
        Ok(identity)
    }
}
