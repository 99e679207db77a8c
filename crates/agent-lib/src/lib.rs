//! Topology discovery and network policy synthesis
//!
//! This crate provides the core functionality for:
//! - Service identity resolution and static dependency graph discovery
//! - Live instance resolution via the service registry and the cluster
//! - Per-endpoint network policy synthesis
//! - The apply/delete reconciliation lifecycle
//! - Health checks and observability

pub mod discovery;
pub mod error;
pub mod health;
pub mod instances;
pub mod models;
pub mod observability;
pub mod policy;
pub mod reconcile;

pub use error::{Result, TopologyError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, TopologyMetrics};
pub use reconcile::{ApplyOptions, CycleReport, ReconcileState, Reconciler, ReconcilerStatus};
