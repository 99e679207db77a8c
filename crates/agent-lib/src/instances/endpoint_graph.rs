//! Address-level projection of the dependency graph

use super::resolver::ResolvedInstances;
use crate::discovery::{DependencyGraph, IdentityMap};
use crate::models::{Endpoint, InstanceSource};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Directed graph over live endpoints, rebuilt every cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointGraph {
    successors: BTreeMap<Endpoint, BTreeSet<Endpoint>>,
    predecessors: BTreeMap<Endpoint, BTreeSet<Endpoint>>,
}

impl EndpointGraph {
    /// For every dependency edge whose two services both have live
    /// instances, connect every caller instance to every callee instance.
    pub fn build(
        graph: &DependencyGraph,
        identity: &IdentityMap,
        instances: &ResolvedInstances,
    ) -> Self {
        let mut endpoints = Self::default();

        for (from, to) in graph.edges() {
            let callers = identity
                .service_for(from)
                .map(|s| instances.endpoints_of(s))
                .unwrap_or_default();
            let callees = identity
                .service_for(to)
                .map(|s| instances.endpoints_of(s))
                .unwrap_or_default();

            for caller in callers {
                for callee in callees {
                    endpoints.add_edge(caller, callee);
                }
            }
        }

        endpoints
    }

    fn add_edge(&mut self, from: &Endpoint, to: &Endpoint) {
        self.predecessors.entry(from.clone()).or_default();
        self.successors.entry(to.clone()).or_default();
        self.successors
            .entry(from.clone())
            .or_default()
            .insert(to.clone());
        self.predecessors
            .entry(to.clone())
            .or_default()
            .insert(from.clone());
    }

    /// Endpoints participating in at least one edge, sorted
    pub fn nodes(&self) -> impl Iterator<Item = &Endpoint> {
        self.successors.keys()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&Endpoint, &Endpoint)> {
        self.successors
            .iter()
            .flat_map(|(from, to)| to.iter().map(move |t| (from, t)))
    }

    pub fn successors(&self, endpoint: &Endpoint) -> impl Iterator<Item = &Endpoint> {
        self.successors.get(endpoint).into_iter().flatten()
    }

    pub fn predecessors(&self, endpoint: &Endpoint) -> impl Iterator<Item = &Endpoint> {
        self.predecessors.get(endpoint).into_iter().flatten()
    }

    pub fn contains_edge(&self, from: &Endpoint, to: &Endpoint) -> bool {
        self.successors.get(from).is_some_and(|s| s.contains(to))
    }

    pub fn node_count(&self) -> usize {
        self.successors.len()
    }

    pub fn edge_count(&self) -> usize {
        self.successors.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.successors.is_empty()
    }

    pub fn view(&self, instances: &ResolvedInstances) -> EndpointGraphView {
        EndpointGraphView {
            source: instances.source(),
            nodes: self
                .nodes()
                .map(|e| EndpointNodeView {
                    label: e.node_label(),
                    group: e.service.clone(),
                    address: e.address.clone(),
                    port: e.port,
                })
                .collect(),
            edges: self
                .edges()
                .map(|(from, to)| EndpointEdgeView {
                    from: from.node_label(),
                    to: to.node_label(),
                })
                .collect(),
            instance_counts: instances.instance_counts().clone(),
            registry_error: instances.registry_error().map(String::from),
        }
    }

    /// Graphviz rendering with one cluster per owning service
    pub fn to_dot(&self) -> String {
        let mut groups: BTreeMap<&str, Vec<&Endpoint>> = BTreeMap::new();
        for endpoint in self.nodes() {
            groups.entry(endpoint.service.as_str()).or_default().push(endpoint);
        }

        let mut out = String::from("digraph endpoints {\n");
        for (i, (service, members)) in groups.iter().enumerate() {
            let _ = writeln!(out, "  subgraph cluster_{} {{", i);
            let _ = writeln!(out, "    label=\"{}\";", service);
            for endpoint in members {
                let _ = writeln!(out, "    \"{}\";", endpoint.node_label());
            }
            out.push_str("  }\n");
        }
        for (from, to) in self.edges() {
            let _ = writeln!(out, "  \"{}\" -> \"{}\";", from.node_label(), to.node_label());
        }
        out.push_str("}\n");
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointNodeView {
    pub label: String,
    /// Owning service
    pub group: String,
    pub address: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointEdgeView {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointGraphView {
    pub source: InstanceSource,
    pub nodes: Vec<EndpointNodeView>,
    pub edges: Vec<EndpointEdgeView>,
    /// Pods found per workload label; cluster strategy only
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub instance_counts: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_error: Option<String>,
}
