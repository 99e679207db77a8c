//! Reconciliation lifecycle
//!
//! A cycle moves Cleared -> Synthesized -> Enforced in full: remove every
//! enforced policy in the namespace, resolve live instances, synthesize and
//! persist one document per endpoint, then submit all of them except the
//! discovery service's own. Cycles never overlap; a second trigger while one
//! runs is rejected with [`TopologyError::CycleInProgress`].

use crate::discovery::StaticTopology;
use crate::error::{Result, TopologyError};
use crate::instances::{ClusterClient, EndpointGraph, InstanceResolver, ResolvedInstances};
use crate::models::InstanceSource;
use crate::observability::{StructuredLogger, TopologyMetrics};
use crate::policy::{PolicyDocument, PolicyStore, PolicySynthesizer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the namespace's enforced policy stands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileState {
    /// No policy enforced
    #[default]
    Cleared,
    /// Documents generated but not submitted
    Synthesized,
    /// Documents submitted to the cluster
    Enforced,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileState::Cleared => write!(f, "cleared"),
            ReconcileState::Synthesized => write!(f, "synthesized"),
            ReconcileState::Enforced => write!(f, "enforced"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    Apply,
    Delete,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub source: InstanceSource,
    /// Stop after writing documents; the cluster is not touched
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTarget {
    pub target: String,
    pub error: String,
}

/// Outcome of one apply or delete cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub kind: CycleKind,
    /// Stage the cycle reached
    pub state: ReconcileState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<InstanceSource>,
    pub namespace: String,
    pub dry_run: bool,
    /// Policy names synthesized this cycle
    pub generated: Vec<String>,
    pub applied: Vec<String>,
    /// Generated but deliberately not submitted (discovery service)
    pub skipped: Vec<String>,
    pub failed: Vec<FailedTarget>,
    /// Targets that should be enforced but are not
    pub unpolicied: Vec<String>,
    /// Graph labels with no live instance this cycle
    pub unscheduled: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_error: Option<String>,
    pub cancelled: bool,
    /// Set when a cancelled cycle could not remove what it had applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CycleReport {
    pub(crate) fn new(kind: CycleKind, namespace: &str) -> Self {
        Self {
            kind,
            state: ReconcileState::Cleared,
            source: None,
            namespace: namespace.to_string(),
            dry_run: false,
            generated: Vec::new(),
            applied: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            unpolicied: Vec::new(),
            unscheduled: Vec::new(),
            registry_error: None,
            cancelled: false,
            rollback_error: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Every document that should have been enforced was
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled && self.rollback_error.is_none()
    }
}

/// Snapshot for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ReconcilerStatus {
    pub state: ReconcileState,
    pub namespace: String,
    pub cycle_in_progress: bool,
    pub last_cycle: Option<CycleReport>,
}

#[derive(Debug, Clone)]
struct RunningCycle {
    kind: CycleKind,
    token: CancellationToken,
}

type SharedRunning = Arc<StdMutex<Option<RunningCycle>>>;

/// Exclusive claim on the reconciler for one cycle.
///
/// Dropping the slot clears the running marker before the cycle lock is
/// released, so a panicking or aborted cycle never leaves a stale marker.
struct CycleSlot {
    running: SharedRunning,
    token: CancellationToken,
    _lock: OwnedMutexGuard<()>,
}

impl Drop for CycleSlot {
    fn drop(&mut self) {
        *lock_running(&self.running) = None;
    }
}

fn lock_running(
    running: &StdMutex<Option<RunningCycle>>,
) -> MutexGuard<'_, Option<RunningCycle>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Drives apply/delete cycles against one namespace.
///
/// Cycles run on their own task, so a caller that goes away mid-cycle
/// (client disconnect, request timeout) does not interrupt enforcement.
pub struct Reconciler {
    topology: Arc<StaticTopology>,
    resolver: InstanceResolver,
    synthesizer: PolicySynthesizer,
    store: PolicyStore,
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    state: RwLock<ReconcileState>,
    last_report: RwLock<Option<CycleReport>>,
    cycle: Arc<Mutex<()>>,
    running: SharedRunning,
    metrics: TopologyMetrics,
    logger: StructuredLogger,
}

impl Reconciler {
    pub fn new(
        topology: Arc<StaticTopology>,
        resolver: InstanceResolver,
        synthesizer: PolicySynthesizer,
        store: PolicyStore,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        let namespace = synthesizer.config().namespace.clone();
        Self {
            topology,
            resolver,
            synthesizer,
            store,
            cluster,
            logger: StructuredLogger::new(namespace.clone()),
            namespace,
            state: RwLock::new(ReconcileState::Cleared),
            last_report: RwLock::new(None),
            cycle: Arc::new(Mutex::new(())),
            running: Arc::new(StdMutex::new(None)),
            metrics: TopologyMetrics::new(),
        }
    }

    pub fn topology(&self) -> &StaticTopology {
        &self.topology
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn state(&self) -> ReconcileState {
        *self.state.read().await
    }

    pub async fn status(&self) -> ReconcilerStatus {
        let cycle_in_progress = lock_running(&self.running).is_some();
        ReconcilerStatus {
            state: self.state().await,
            namespace: self.namespace.clone(),
            cycle_in_progress,
            last_cycle: self.last_report.read().await.clone(),
        }
    }

    async fn set_state(&self, state: ReconcileState) {
        *self.state.write().await = state;
        debug!(state = %state, "Reconciler state changed");
    }

    fn begin_cycle(&self, kind: CycleKind, token: CancellationToken) -> Result<CycleSlot> {
        let lock = Arc::clone(&self.cycle)
            .try_lock_owned()
            .map_err(|_| TopologyError::CycleInProgress)?;
        *lock_running(&self.running) = Some(RunningCycle {
            kind,
            token: token.clone(),
        });
        Ok(CycleSlot {
            running: Arc::clone(&self.running),
            token,
            _lock: lock,
        })
    }

    /// Run a full apply cycle
    pub async fn apply(self: &Arc<Self>, options: ApplyOptions) -> Result<CycleReport> {
        self.apply_until(options, CancellationToken::new()).await
    }

    /// Run a full apply cycle that also stops when `parent` is cancelled
    pub async fn apply_until(
        self: &Arc<Self>,
        options: ApplyOptions,
        parent: CancellationToken,
    ) -> Result<CycleReport> {
        let slot = self.begin_cycle(CycleKind::Apply, parent.child_token())?;
        let reconciler = Arc::clone(self);
        tokio::spawn(async move { reconciler.run_apply_cycle(options, slot).await })
            .await
            .map_err(|e| TopologyError::CycleAborted(e.to_string()))?
    }

    async fn run_apply_cycle(&self, options: ApplyOptions, slot: CycleSlot) -> Result<CycleReport> {
        let started = Instant::now();
        self.logger
            .log_cycle_started(&options.source.to_string(), options.dry_run);

        let mut report = CycleReport::new(CycleKind::Apply, &self.namespace);
        report.source = Some(options.source);
        report.dry_run = options.dry_run;

        let outcome = self.run_apply(options, &slot.token, &mut report).await;

        report.duration_ms = elapsed_ms(started);
        self.metrics.observe_cycle_duration(started.elapsed().as_secs_f64());
        outcome?;

        self.logger.log_cycle_completed(
            &report.state.to_string(),
            report.generated.len(),
            report.applied.len(),
            report.failed.len(),
            report.duration_ms,
        );
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    async fn run_apply(
        &self,
        options: ApplyOptions,
        token: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<()> {
        if !options.dry_run {
            self.cluster.delete_all_policies().await?;
            self.set_state(ReconcileState::Cleared).await;
        }
        self.store.clear()?;

        let (endpoints, instances) = self.resolve_endpoints(options.source).await;
        report.unscheduled = instances.unscheduled(&self.topology.graph, &self.topology.identity);
        report.registry_error = instances.registry_error().map(String::from);

        let documents = self
            .synthesizer
            .synthesize(&endpoints, &self.topology.graph.discovery().service);
        for document in &documents {
            self.store.write(document)?;
            report.generated.push(document.name().to_string());
        }
        self.metrics.set_policies_generated(documents.len());
        report.state = ReconcileState::Synthesized;

        if options.dry_run {
            info!(
                documents = documents.len(),
                dir = %self.store.dir().display(),
                "Dry run, policies not enforced"
            );
            return Ok(());
        }
        self.set_state(ReconcileState::Synthesized).await;

        self.enforce(&documents, token, report).await;
        // A failed rollback leaves the already-applied documents in place
        report.state = if report.cancelled && report.rollback_error.is_none() {
            ReconcileState::Cleared
        } else {
            ReconcileState::Enforced
        };
        self.set_state(report.state).await;
        Ok(())
    }

    /// Submit documents one at a time, checking for cancellation between them
    async fn enforce(
        &self,
        documents: &[PolicyDocument],
        token: &CancellationToken,
        report: &mut CycleReport,
    ) {
        for (i, document) in documents.iter().enumerate() {
            if token.is_cancelled() {
                report.cancelled = true;
                self.roll_back(report).await;
                let mut unpolicied: Vec<String> = documents
                    .iter()
                    .filter(|d| !d.is_discovery)
                    .map(|d| d.name().to_string())
                    .filter(|name| !report.applied.contains(name))
                    .collect();
                unpolicied.sort();
                unpolicied.dedup();
                report.unpolicied = unpolicied;
                debug!(remaining = documents.len() - i, "Apply loop stopped");
                return;
            }

            if document.is_discovery {
                info!(policy = %document.name(), "Skipping discovery service policy");
                report.skipped.push(document.name().to_string());
                continue;
            }

            match self.cluster.apply_policy(&document.policy).await {
                Ok(()) => {
                    self.metrics.inc_policies_applied();
                    report.applied.push(document.name().to_string());
                }
                Err(e) => {
                    self.metrics.inc_apply_failures();
                    self.logger.log_apply_failed(document.name(), &e.to_string());
                    report.failed.push(FailedTarget {
                        target: document.name().to_string(),
                        error: e.to_string(),
                    });
                    report.unpolicied.push(document.name().to_string());
                }
            }
        }
    }

    /// Remove what a cancelled cycle already applied
    async fn roll_back(&self, report: &mut CycleReport) {
        match self.cluster.delete_all_policies().await {
            Ok(()) => {
                self.logger.log_cycle_cancelled(report.applied.len());
                report.applied.clear();
            }
            Err(e) => {
                self.logger
                    .log_rollback_failed(report.applied.len(), &e.to_string());
                report.rollback_error = Some(e.to_string());
            }
        }
    }

    /// Return to Cleared without resynthesizing.
    ///
    /// Delete cycles are not cancellable.
    pub async fn delete(self: &Arc<Self>) -> Result<CycleReport> {
        let slot = self.begin_cycle(CycleKind::Delete, CancellationToken::new())?;
        let reconciler = Arc::clone(self);
        tokio::spawn(async move { reconciler.run_delete_cycle(slot).await })
            .await
            .map_err(|e| TopologyError::CycleAborted(e.to_string()))?
    }

    async fn run_delete_cycle(&self, _slot: CycleSlot) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::new(CycleKind::Delete, &self.namespace);

        self.run_delete().await?;

        report.duration_ms = elapsed_ms(started);
        self.logger
            .log_cycle_completed(&report.state.to_string(), 0, 0, 0, report.duration_ms);
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    async fn run_delete(&self) -> Result<()> {
        self.cluster.delete_all_policies().await?;
        self.store.clear()?;
        self.set_state(ReconcileState::Cleared).await;
        Ok(())
    }

    /// Cancel the in-flight apply cycle; false when nothing cancellable is running
    pub async fn cancel(&self) -> bool {
        let running = lock_running(&self.running).clone();
        match running {
            Some(RunningCycle {
                kind: CycleKind::Apply,
                token,
            }) => {
                token.cancel();
                true
            }
            Some(RunningCycle {
                kind: CycleKind::Delete,
                ..
            }) => {
                warn!("Cancel requested during a delete cycle, ignored");
                false
            }
            None => {
                warn!("Cancel requested but no cycle is running");
                false
            }
        }
    }

    /// Names of the policies currently enforced in the namespace
    pub async fn enforced_policies(&self) -> Result<Vec<String>> {
        let mut names = self.cluster.list_policies().await?;
        names.sort();
        Ok(names)
    }

    /// Resolve live instances and project the dependency graph onto them
    pub async fn resolve_endpoints(
        &self,
        source: InstanceSource,
    ) -> (EndpointGraph, ResolvedInstances) {
        let instances = self
            .resolver
            .resolve(source, &self.topology.graph, &self.topology.identity)
            .await;
        let endpoints =
            EndpointGraph::build(&self.topology.graph, &self.topology.identity, &instances);
        (endpoints, instances)
    }
}

#[cfg(test)]
mod tests;
