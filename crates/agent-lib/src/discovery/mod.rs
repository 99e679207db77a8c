//! Static topology discovery
//!
//! Runs once at startup: resolve service identities from the source tree,
//! then scan the extracted artifacts into a [`DependencyGraph`].

pub mod artifacts;
pub mod graph;
pub mod identity;
pub mod scanner;

pub use artifacts::{ArtifactSource, ArtifactUnit, ConfigDocument, DirectoryArtifacts, SourceText};
pub use graph::{
    DependencyGraph, DependencyGraphView, DiscoveryIdentity, GraphBuilder, ReferenceKind,
    StaticTopology, UnresolvedReference,
};
pub use identity::{IdentityMap, IdentityResolver};
pub use scanner::{Annotation, AnnotationScanner, RegexScanner};

use crate::error::{Result, TopologyError};
use crate::observability::{StructuredLogger, TopologyMetrics};
use std::sync::Arc;

/// Resolve identities with `resolver`, then build the graph from `source`
pub async fn discover(
    resolver: IdentityResolver,
    source: Arc<dyn ArtifactSource>,
    builder: &GraphBuilder,
    logger: &StructuredLogger,
    metrics: &TopologyMetrics,
) -> Result<StaticTopology> {
    let identity = tokio::task::spawn_blocking(move || resolver.resolve())
        .await
        .map_err(|e| TopologyError::parse("identity resolution", e))??;

    let topology = builder.build_from(source, identity).await?;

    let graph = &topology.graph;
    logger.log_discovery(
        topology.identity.len(),
        graph.node_count(),
        graph.edge_count(),
        graph.unresolved().len(),
    );
    metrics.set_graph_size(graph.edge_count(), graph.unresolved().len());

    Ok(topology)
}
