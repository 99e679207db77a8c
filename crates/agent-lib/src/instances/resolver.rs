//! Maps logical services to their live endpoints

use super::cluster::ClusterClient;
use super::registry::ServiceRegistry;
use crate::discovery::{DependencyGraph, IdentityMap};
use crate::models::{Endpoint, InstanceSource};
use crate::observability::{StructuredLogger, TopologyMetrics};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Live endpoints per service for one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedInstances {
    source: InstanceSource,
    by_service: BTreeMap<String, Vec<Endpoint>>,
    instance_counts: BTreeMap<String, usize>,
    registry_error: Option<String>,
}

impl ResolvedInstances {
    pub fn new(source: InstanceSource) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub fn from_endpoints(
        source: InstanceSource,
        endpoints: impl IntoIterator<Item = Endpoint>,
    ) -> Self {
        let mut resolved = Self::new(source);
        for endpoint in endpoints {
            resolved.add(endpoint);
        }
        resolved
    }

    /// Record an endpoint; duplicates are ignored and each list stays sorted
    pub fn add(&mut self, endpoint: Endpoint) {
        let list = self.by_service.entry(endpoint.service.clone()).or_default();
        if let Err(pos) = list.binary_search(&endpoint) {
            list.insert(pos, endpoint);
        }
    }

    pub fn source(&self) -> InstanceSource {
        self.source
    }

    /// Live endpoints of `service`; empty when it is unscheduled
    pub fn endpoints_of(&self, service: &str) -> &[Endpoint] {
        self.by_service
            .get(&service.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.by_service.keys().map(String::as_str)
    }

    pub fn endpoint_count(&self) -> usize {
        self.by_service.values().map(Vec::len).sum()
    }

    /// Pods found per workload label (cluster strategy)
    pub fn instance_counts(&self) -> &BTreeMap<String, usize> {
        &self.instance_counts
    }

    /// Why registry instances are missing this cycle, if they are
    pub fn registry_error(&self) -> Option<&str> {
        self.registry_error.as_deref()
    }

    /// Graph labels whose service has no live endpoint this cycle
    pub fn unscheduled(&self, graph: &DependencyGraph, identity: &IdentityMap) -> Vec<String> {
        graph
            .nodes()
            .filter(|label| {
                identity
                    .service_for(label)
                    .map_or(true, |service| self.endpoints_of(service).is_empty())
            })
            .map(String::from)
            .collect()
    }
}

/// Queries the registry and the scheduler for live instances
pub struct InstanceResolver {
    registry: Arc<dyn ServiceRegistry>,
    cluster: Arc<dyn ClusterClient>,
    label_key: String,
    concurrency: usize,
    metrics: TopologyMetrics,
    logger: StructuredLogger,
}

impl InstanceResolver {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        cluster: Arc<dyn ClusterClient>,
        label_key: impl Into<String>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            registry,
            cluster,
            label_key: label_key.into(),
            concurrency: 8,
            metrics: TopologyMetrics::new(),
            logger,
        }
    }

    /// Maximum number of concurrent scheduler queries
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn resolve(
        &self,
        source: InstanceSource,
        graph: &DependencyGraph,
        identity: &IdentityMap,
    ) -> ResolvedInstances {
        let resolved = match source {
            InstanceSource::Registry => self.from_registry(graph).await,
            InstanceSource::Cluster => self.from_cluster(identity).await,
        };

        self.metrics.set_endpoints_resolved(resolved.endpoint_count());
        info!(
            source = %source,
            services = resolved.by_service.len(),
            endpoints = resolved.endpoint_count(),
            "Resolved live instances"
        );
        resolved
    }

    /// Registry listing, plus a scheduler lookup for the registry's own pods
    async fn from_registry(&self, graph: &DependencyGraph) -> ResolvedInstances {
        let mut resolved = ResolvedInstances::new(InstanceSource::Registry);

        match self.registry.instances().await {
            Ok(endpoints) => endpoints.into_iter().for_each(|e| resolved.add(e)),
            Err(e) => {
                self.metrics.inc_registry_errors();
                self.logger.log_registry_unavailable(&e.to_string());
                resolved.registry_error = Some(e.to_string());
            }
        }

        let discovery = graph.discovery();
        match self.cluster.pod_addresses(&self.label_key, &discovery.label).await {
            Ok(pods) => {
                for pod in pods {
                    resolved.add(Endpoint::new(&discovery.service, pod.address, pod.port));
                }
            }
            Err(e) => {
                warn!(
                    label = %discovery.label,
                    error = %e,
                    "Failed to locate discovery service pods"
                );
            }
        }

        resolved
    }

    /// One bounded-concurrency pod query per known workload label
    async fn from_cluster(&self, identity: &IdentityMap) -> ResolvedInstances {
        let mut resolved = ResolvedInstances::new(InstanceSource::Cluster);

        let lookups: Vec<(String, String)> = identity
            .labels()
            .filter_map(|label| {
                identity
                    .service_for(label)
                    .map(|service| (label.to_string(), service.to_string()))
            })
            .collect();

        let mut results: Vec<_> = stream::iter(lookups)
            .map(|(label, service)| async move {
                let pods = self.cluster.pod_addresses(&self.label_key, &label).await;
                (label, service, pods)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        for (label, service, pods) in results {
            match pods {
                Ok(pods) => {
                    debug!(label = %label, pods = pods.len(), "Resolved pods for label");
                    resolved.instance_counts.insert(label, pods.len());
                    for pod in pods {
                        resolved.add(Endpoint::new(&service, pod.address, pod.port));
                    }
                }
                Err(e) => {
                    warn!(label = %label, error = %e, "Pod query failed, treating as unscheduled");
                    resolved.instance_counts.insert(label, 0);
                }
            }
        }

        resolved
    }
}
