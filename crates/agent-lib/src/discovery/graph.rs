//! Static service dependency graph
//!
//! Nodes are workload labels, an edge `a -> b` means a service labelled `a`
//! calls a service labelled `b`. The graph is built once from artifact
//! evidence and is read-only afterwards.

use super::artifacts::{ArtifactSource, ArtifactUnit};
use super::identity::IdentityMap;
use super::scanner::{Annotation, AnnotationScanner, RegexScanner};
use crate::error::{Result, TopologyError};
use crate::observability::StructuredLogger;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default reserved label of the discovery node
pub const DEFAULT_DISCOVERY_LABEL: &str = "k8n-service-discovery";

/// Default service name of the discovery server
pub const DEFAULT_DISCOVERY_SERVICE: &str = "containerized-discovery";

/// The registry/discovery service as seen by the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryIdentity {
    pub service: String,
    pub label: String,
}

impl Default for DiscoveryIdentity {
    fn default() -> Self {
        Self {
            service: DEFAULT_DISCOVERY_SERVICE.to_string(),
            label: DEFAULT_DISCOVERY_LABEL.to_string(),
        }
    }
}

/// How an unresolved reference was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// The artifact's own service name has no workload label
    Owner,
    Route,
    ClientBinding,
}

/// A reference that could not be mapped to a workload label
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedReference {
    pub origin: String,
    pub referrer: String,
    pub reference: String,
    pub kind: ReferenceKind,
}

/// Directed "calls" graph over workload labels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// label -> callees; every node is a key
    edges: BTreeMap<String, BTreeSet<String>>,
    discovery: DiscoveryIdentity,
    unresolved: Vec<UnresolvedReference>,
}

impl DependencyGraph {
    /// Graph from explicit edges; the closing discovery pass is applied
    pub fn from_edges<'a>(
        discovery: DiscoveryIdentity,
        edges: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut graph = Self {
            edges: BTreeMap::new(),
            discovery,
            unresolved: Vec::new(),
        };
        for (from, to) in edges {
            graph.add_edge(from, to);
        }
        graph.close_over_discovery();
        graph
    }

    fn add_node(&mut self, label: &str) {
        self.edges.entry(label.to_string()).or_default();
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(to);
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    /// Every node other than the discovery node gets an edge to it
    fn close_over_discovery(&mut self) {
        let discovery = self.discovery.label.clone();
        self.add_node(&discovery);
        for (label, callees) in self.edges.iter_mut() {
            if *label != discovery {
                callees.insert(discovery.clone());
            }
        }
    }

    pub fn discovery(&self) -> &DiscoveryIdentity {
        &self.discovery
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    /// All edges in (caller, callee) order, sorted
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges
            .iter()
            .flat_map(|(from, to)| to.iter().map(move |t| (from.as_str(), t.as_str())))
    }

    pub fn successors(&self, label: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(label)
            .into_iter()
            .flat_map(|callees| callees.iter().map(String::as_str))
    }

    pub fn contains_node(&self, label: &str) -> bool {
        self.edges.contains_key(label)
    }

    pub fn contains_edge(&self, from: &str, to: &str) -> bool {
        self.edges.get(from).is_some_and(|callees| callees.contains(to))
    }

    pub fn node_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    pub fn unresolved(&self) -> &[UnresolvedReference] {
        &self.unresolved
    }

    /// Serializable snapshot for the control surface
    pub fn view(&self, identity: &IdentityMap) -> DependencyGraphView {
        DependencyGraphView {
            discovery: self.discovery.clone(),
            nodes: self
                .nodes()
                .map(|label| ServiceNodeView {
                    label: label.to_string(),
                    service: identity.service_for(label).map(String::from),
                })
                .collect(),
            edges: self
                .edges()
                .map(|(from, to)| EdgeView {
                    from: from.to_string(),
                    to: to.to_string(),
                })
                .collect(),
            unresolved: self.unresolved.clone(),
        }
    }

    /// Graphviz rendering of the label graph
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph services {\n");
        for node in self.nodes() {
            let shape = if node == self.discovery.label {
                "doublecircle"
            } else {
                "box"
            };
            let _ = writeln!(out, "  \"{}\" [shape={}];", node, shape);
        }
        for (from, to) in self.edges() {
            let _ = writeln!(out, "  \"{}\" -> \"{}\";", from, to);
        }
        out.push_str("}\n");
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceNodeView {
    pub label: String,
    pub service: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeView {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyGraphView {
    pub discovery: DiscoveryIdentity,
    pub nodes: Vec<ServiceNodeView>,
    pub edges: Vec<EdgeView>,
    pub unresolved: Vec<UnresolvedReference>,
}

/// What one artifact declares, before identity resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactEvidence {
    pub origin: String,
    pub service: Option<String>,
    pub routes: Vec<String>,
    /// One recognized call target per source file
    pub clients: Vec<String>,
    pub is_discovery: bool,
}

impl ArtifactEvidence {
    /// Run both extraction passes over one unit
    pub fn extract(unit: &ArtifactUnit, scanner: &dyn AnnotationScanner) -> Self {
        let mut evidence = ArtifactEvidence {
            origin: unit.origin.clone(),
            service: unit.config.service_name(),
            routes: unit.config.gateway_routes(),
            ..Default::default()
        };

        for source in &unit.sources {
            let text = match source.read() {
                Ok(text) => text,
                Err(e) => {
                    warn!(file = %source.name(), error = %e, "Failed to read source file");
                    continue;
                }
            };
            match scanner.scan(&text) {
                Some(Annotation::ClientOf(target)) => {
                    debug!(file = %source.name(), target = %target, "Found client binding");
                    evidence.clients.push(target);
                }
                Some(Annotation::DiscoveryServer) => {
                    debug!(file = %source.name(), "Found discovery server marker");
                    evidence.is_discovery = true;
                }
                None => {}
            }
        }

        evidence
    }
}

/// Identity mapping and dependency graph produced at startup
#[derive(Debug, Clone)]
pub struct StaticTopology {
    pub identity: IdentityMap,
    pub graph: DependencyGraph,
}

/// Builds a [`DependencyGraph`] from artifact units
pub struct GraphBuilder {
    scanner: Arc<dyn AnnotationScanner>,
    concurrency: usize,
    default_discovery: DiscoveryIdentity,
    logger: StructuredLogger,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            scanner: Arc::new(RegexScanner::default()),
            concurrency: 8,
            default_discovery: DiscoveryIdentity::default(),
            logger: StructuredLogger::new("default"),
        }
    }

    /// Replace the annotation scanner
    pub fn scanner(mut self, scanner: Arc<dyn AnnotationScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Maximum number of artifacts scanned at once
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Discovery identity used when no artifact carries the discovery marker
    pub fn default_discovery(mut self, label: &str, service: &str) -> Self {
        self.default_discovery = DiscoveryIdentity {
            service: service.to_lowercase(),
            label: label.to_string(),
        };
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Scan all units with bounded parallelism, then merge in origin order
    pub async fn scan(&self, units: Vec<ArtifactUnit>) -> Vec<ArtifactEvidence> {
        let mut evidence: Vec<ArtifactEvidence> = stream::iter(units)
            .map(|unit| {
                let scanner = Arc::clone(&self.scanner);
                tokio::task::spawn_blocking(move || ArtifactEvidence::extract(&unit, &*scanner))
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|joined| async move {
                match joined {
                    Ok(evidence) => Some(evidence),
                    Err(e) => {
                        warn!(error = %e, "Artifact scan task failed");
                        None
                    }
                }
            })
            .collect()
            .await;

        evidence.sort_by(|a, b| a.origin.cmp(&b.origin));
        evidence
    }

    /// Read units from `source`, scan them and build the topology
    pub async fn build_from(
        &self,
        source: Arc<dyn ArtifactSource>,
        identity: IdentityMap,
    ) -> Result<StaticTopology> {
        let units = tokio::task::spawn_blocking(move || source.units())
            .await
            .map_err(|e| TopologyError::parse("artifact source", e))??;
        let evidence = self.scan(units).await;
        Ok(self.assemble(&evidence, identity))
    }

    /// Single-writer merge of scanned evidence into the graph
    pub fn assemble(
        &self,
        evidence: &[ArtifactEvidence],
        mut identity: IdentityMap,
    ) -> StaticTopology {
        let mut graph = DependencyGraph::default();
        let mut discovery_service: Option<String> = None;

        for item in evidence {
            let Some(service) = item.service.as_deref() else {
                debug!(origin = %item.origin, "Artifact declares no service name, skipping");
                continue;
            };

            if item.is_discovery {
                match &discovery_service {
                    None => discovery_service = Some(service.to_string()),
                    Some(existing) if existing != service => {
                        warn!(
                            origin = %item.origin,
                            service = %service,
                            existing = %existing,
                            "Multiple discovery servers detected, keeping the first"
                        );
                    }
                    Some(_) => {}
                }
            }

            let caller = match identity.resolve_label(service, service) {
                Ok(label) => label.to_string(),
                Err(_) => {
                    self.record_unresolved(
                        &mut graph,
                        item,
                        service,
                        service,
                        ReferenceKind::Owner,
                    );
                    continue;
                }
            };
            graph.add_node(&caller);

            let targets = item
                .routes
                .iter()
                .map(|r| (r, ReferenceKind::Route))
                .chain(item.clients.iter().map(|c| (c, ReferenceKind::ClientBinding)));

            for (target, kind) in targets {
                match identity.resolve_label(service, target) {
                    Ok(callee) => graph.add_edge(&caller, callee),
                    Err(_) => self.record_unresolved(&mut graph, item, service, target, kind),
                }
            }
        }

        let discovery = match discovery_service {
            Some(service) => DiscoveryIdentity {
                label: identity
                    .label_for(&service)
                    .map(String::from)
                    .unwrap_or_else(|| self.default_discovery.label.clone()),
                service,
            },
            None => self.default_discovery.clone(),
        };
        identity.alias(&discovery.label, &discovery.service);
        graph.discovery = discovery;
        graph.close_over_discovery();

        info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            unresolved = graph.unresolved.len(),
            discovery = %graph.discovery.label,
            "Dependency graph built"
        );

        StaticTopology { identity, graph }
    }

    fn record_unresolved(
        &self,
        graph: &mut DependencyGraph,
        item: &ArtifactEvidence,
        referrer: &str,
        reference: &str,
        kind: ReferenceKind,
    ) {
        self.logger.log_unresolved(&item.origin, referrer, reference);
        graph.unresolved.push(UnresolvedReference {
            origin: item.origin.clone(),
            referrer: referrer.to_string(),
            reference: reference.to_string(),
            kind,
        });
    }
}
