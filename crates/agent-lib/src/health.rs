//! Component health for liveness and readiness probes
//!
//! The agent is ready once the static dependency graph exists and stays
//! ready while that graph is intact. Liveness is the worst status among the
//! tracked components: a lost cluster connection makes the agent unhealthy,
//! a registry outage or rejected policies only degrade it.

use crate::error::TopologyError;
use crate::reconcile::CycleReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still serving cycles, with reduced evidence or partial enforcement
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the status last changed
    pub since: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: Utc::now(),
        }
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const STATIC_GRAPH: &str = "static_graph";
    pub const REGISTRY: &str = "registry";
    pub const CLUSTER: &str = "cluster";
    pub const RECONCILER: &str = "reconciler";

    pub const ALL: [&str; 4] = [STATIC_GRAPH, REGISTRY, CLUSTER, RECONCILER];
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track every component of the agent, all starting healthy
    pub async fn register_all(&self) {
        let mut components = self.components.write().await;
        for name in components::ALL {
            components
                .entry(name.to_string())
                .or_insert_with(|| ComponentHealth::new(ComponentStatus::Healthy, None));
        }
    }

    /// Record a status; the timestamp only moves when the status changes
    async fn record(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut components = self.components.write().await;
        match components.get_mut(name) {
            Some(current) if current.status == status => current.message = message,
            _ => {
                components.insert(name.to_string(), ComponentHealth::new(status, message));
            }
        }
    }

    pub async fn set_healthy(&self, name: &str) {
        self.record(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.record(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.record(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    /// Flipped once the static dependency graph is built
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Fold the outcome of a finished cycle into component health
    pub async fn observe_cycle(&self, report: &CycleReport) {
        match &report.registry_error {
            Some(error) => self.set_degraded(components::REGISTRY, error.clone()).await,
            None => self.set_healthy(components::REGISTRY).await,
        }
        match &report.rollback_error {
            Some(error) => {
                self.set_unhealthy(components::CLUSTER, error.clone()).await;
                let message = format!(
                    "rollback after cancel failed, {} policies left applied",
                    report.applied.len()
                );
                self.set_degraded(components::RECONCILER, message).await;
            }
            None if !report.failed.is_empty() => {
                self.set_healthy(components::CLUSTER).await;
                let message = format!("{} policies rejected by the cluster", report.failed.len());
                self.set_degraded(components::RECONCILER, message).await;
            }
            None => {
                self.set_healthy(components::CLUSTER).await;
                self.set_healthy(components::RECONCILER).await;
            }
        }
    }

    /// Record a cycle that aborted with `error`
    pub async fn observe_failure(&self, error: &TopologyError) {
        match error {
            TopologyError::CycleInProgress => {}
            TopologyError::Cluster(message) => {
                self.set_unhealthy(components::CLUSTER, message.clone()).await;
            }
            other => {
                self.set_degraded(components::RECONCILER, other.to_string()).await;
            }
        }
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let graph_broken = self
            .components
            .read()
            .await
            .get(components::STATIC_GRAPH)
            .is_some_and(|c| c.status == ComponentStatus::Unhealthy);

        let reason = if !ready {
            Some("Static dependency graph not built yet")
        } else if graph_broken {
            Some("Static dependency graph unavailable")
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(String::from),
        }
    }
}
