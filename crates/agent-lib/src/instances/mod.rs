//! Live instance resolution
//!
//! Everything here is re-fetched on every reconciliation cycle; nothing is
//! cached across cycles.

pub mod cluster;
pub mod endpoint_graph;
pub mod registry;
pub mod resolver;

pub use cluster::{ClusterClient, KubeCluster, Kubectl, PodAddress};
pub use endpoint_graph::{EndpointGraph, EndpointGraphView};
pub use registry::{EurekaRegistry, ServiceRegistry};
pub use resolver::{InstanceResolver, ResolvedInstances};
