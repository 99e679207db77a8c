//! Observability infrastructure for the topology agent
//!
//! Provides:
//! - Prometheus metrics (cycle latency, policy counts, registry errors, graph size)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for reconciliation cycles (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<TopologyMetricsInner> = OnceLock::new();

struct TopologyMetricsInner {
    reconcile_duration_seconds: Histogram,
    policies_generated: IntGauge,
    policies_applied: IntCounter,
    apply_failures: IntCounter,
    registry_errors: IntCounter,
    unresolved_identities: IntGauge,
    endpoints_resolved: IntGauge,
    dependency_edges: IntGauge,
}

impl TopologyMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_duration_seconds: register_histogram!(
                "topoguard_reconcile_duration_seconds",
                "Wall time of a full reconciliation cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            policies_generated: register_int_gauge!(
                "topoguard_policies_generated",
                "Policy documents synthesized in the last cycle"
            )
            .expect("Failed to register policies_generated"),

            policies_applied: register_int_counter!(
                "topoguard_policies_applied_total",
                "Policy documents accepted by the cluster"
            )
            .expect("Failed to register policies_applied"),

            apply_failures: register_int_counter!(
                "topoguard_apply_failures_total",
                "Policy documents rejected by the cluster"
            )
            .expect("Failed to register apply_failures"),

            registry_errors: register_int_counter!(
                "topoguard_registry_errors_total",
                "Failed service registry queries"
            )
            .expect("Failed to register registry_errors"),

            unresolved_identities: register_int_gauge!(
                "topoguard_unresolved_identities",
                "Dependency references without a workload label"
            )
            .expect("Failed to register unresolved_identities"),

            endpoints_resolved: register_int_gauge!(
                "topoguard_endpoints_resolved",
                "Live endpoints resolved in the last cycle"
            )
            .expect("Failed to register endpoints_resolved"),

            dependency_edges: register_int_gauge!(
                "topoguard_dependency_edges",
                "Edges in the static dependency graph"
            )
            .expect("Failed to register dependency_edges"),
        }
    }
}

/// Handle to the process-wide topology metrics
///
/// Clones share the same underlying Prometheus collectors.
#[derive(Clone)]
pub struct TopologyMetrics {
    _private: (),
}

impl Default for TopologyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TopologyMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TopologyMetricsInner {
        GLOBAL_METRICS.get_or_init(TopologyMetricsInner::new)
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.inner().reconcile_duration_seconds.observe(duration_secs);
    }

    pub fn set_policies_generated(&self, count: usize) {
        self.inner().policies_generated.set(count as i64);
    }

    pub fn inc_policies_applied(&self) {
        self.inner().policies_applied.inc();
    }

    pub fn inc_apply_failures(&self) {
        self.inner().apply_failures.inc();
    }

    pub fn inc_registry_errors(&self) {
        self.inner().registry_errors.inc();
    }

    /// Record the size of the static graph after discovery
    pub fn set_graph_size(&self, edges: usize, unresolved: usize) {
        self.inner().dependency_edges.set(edges as i64);
        self.inner().unresolved_identities.set(unresolved as i64);
    }

    pub fn set_endpoints_resolved(&self, count: usize) {
        self.inner().endpoints_resolved.set(count as i64);
    }
}

/// Structured logger for lifecycle events
///
/// Every event carries a stable `event` field and the target namespace.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    namespace: String,
}

impl StructuredLogger {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn log_startup(&self, version: &str, instance_source: &str) {
        info!(
            event = "agent_started",
            namespace = %self.namespace,
            agent_version = %version,
            instance_source = %instance_source,
            "Topology agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            namespace = %self.namespace,
            reason = %reason,
            "Topology agent shutting down"
        );
    }

    pub fn log_discovery(&self, services: usize, nodes: usize, edges: usize, unresolved: usize) {
        info!(
            event = "discovery_complete",
            namespace = %self.namespace,
            services = services,
            nodes = nodes,
            edges = edges,
            unresolved = unresolved,
            "Static dependency graph ready"
        );
    }

    /// A dependency reference was skipped because its service has no label
    pub fn log_unresolved(&self, origin: &str, referrer: &str, reference: &str) {
        warn!(
            event = "identity_unresolved",
            namespace = %self.namespace,
            origin = %origin,
            referrer = %referrer,
            reference = %reference,
            "Dependency reference has no workload label, edge skipped"
        );
    }

    pub fn log_cycle_started(&self, source: &str, dry_run: bool) {
        info!(
            event = "cycle_started",
            namespace = %self.namespace,
            source = %source,
            dry_run = dry_run,
            "Reconciliation cycle started"
        );
    }

    pub fn log_cycle_completed(
        &self,
        state: &str,
        generated: usize,
        applied: usize,
        failed: usize,
        duration_ms: u64,
    ) {
        if failed > 0 {
            warn!(
                event = "cycle_completed",
                namespace = %self.namespace,
                state = %state,
                generated = generated,
                applied = applied,
                failed = failed,
                duration_ms = duration_ms,
                "Reconciliation cycle completed with failures"
            );
        } else {
            info!(
                event = "cycle_completed",
                namespace = %self.namespace,
                state = %state,
                generated = generated,
                applied = applied,
                duration_ms = duration_ms,
                "Reconciliation cycle completed"
            );
        }
    }

    pub fn log_cycle_cancelled(&self, applied_before_cancel: usize) {
        warn!(
            event = "cycle_cancelled",
            namespace = %self.namespace,
            rolled_back = applied_before_cancel,
            "Reconciliation cycle cancelled, enforced policies rolled back"
        );
    }

    pub fn log_rollback_failed(&self, applied_before_cancel: usize, error: &str) {
        error!(
            event = "cycle_rollback_failed",
            namespace = %self.namespace,
            still_applied = applied_before_cancel,
            error = %error,
            "Reconciliation cycle cancelled but rollback failed, applied policies remain"
        );
    }

    pub fn log_apply_failed(&self, target: &str, error: &str) {
        warn!(
            event = "policy_apply_failed",
            namespace = %self.namespace,
            target = %target,
            error = %error,
            "Cluster rejected policy"
        );
    }

    pub fn log_registry_unavailable(&self, error: &str) {
        warn!(
            event = "registry_unavailable",
            namespace = %self.namespace,
            error = %error,
            "Service registry unavailable, registry instances absent this cycle"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_metrics_handles_share_registry() {
        let metrics = TopologyMetrics::new();
        let other = metrics.clone();

        metrics.observe_cycle_duration(0.2);
        metrics.set_policies_generated(4);
        other.inc_policies_applied();
        other.set_graph_size(7, 1);
        other.set_endpoints_resolved(3);

        assert_eq!(metrics.inner().policies_generated.get(), 4);
        assert_eq!(metrics.inner().endpoints_resolved.get(), 3);
        assert_eq!(metrics.inner().dependency_edges.get(), 7);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("shop");
        assert_eq!(logger.namespace, "shop");
    }
}
