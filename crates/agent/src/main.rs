//! Topology agent
//!
//! Builds the static dependency graph once at startup, then serves the
//! control surface that triggers policy reconciliation cycles.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use topoguard_agent::{
    api,
    config::{AgentConfig, ClusterBackend},
};
use topoguard_lib::{
    discovery::{self, DirectoryArtifacts, GraphBuilder, IdentityResolver},
    health::{components, HealthRegistry},
    instances::{ClusterClient, EurekaRegistry, InstanceResolver, KubeCluster, Kubectl},
    observability::{StructuredLogger, TopologyMetrics},
    policy::{PolicyStore, PolicySynthesizer},
    Reconciler,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting topoguard-agent");

    let config = AgentConfig::load()?;
    config.validate().context("startup validation failed")?;
    info!(
        namespace = %config.namespace,
        root_dir = %config.root_dir.display(),
        instance_source = %config.instance_source,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let metrics = TopologyMetrics::new();
    let logger = StructuredLogger::new(&config.namespace);
    logger.log_startup(AGENT_VERSION, &config.instance_source.to_string());

    // Static discovery runs exactly once
    let builder = GraphBuilder::new()
        .concurrency(config.scan_concurrency)
        .default_discovery(&config.discovery_label, &config.discovery_service)
        .logger(logger.clone());
    let topology = match discovery::discover(
        IdentityResolver::new(&config.root_dir, &config.workload_label_key),
        Arc::new(DirectoryArtifacts::new(&config.archive_dir, &config.work_dir)),
        &builder,
        &logger,
        &metrics,
    )
    .await
    {
        Ok(topology) => topology,
        Err(e) => {
            error!(error = %e, "Static discovery failed");
            health_registry
                .set_unhealthy(components::STATIC_GRAPH, e.to_string())
                .await;
            return Err(e).context("static discovery failed");
        }
    };

    let cluster: Arc<dyn ClusterClient> = match config.cluster_backend {
        ClusterBackend::Kube => Arc::new(
            KubeCluster::try_default(&config.namespace)
                .await
                .context("failed to create Kubernetes client")?,
        ),
        ClusterBackend::Kubectl => Arc::new(Kubectl::new(&config.kubectl_path, &config.namespace)),
    };
    let registry = Arc::new(
        EurekaRegistry::new(&config.registry_url, config.registry_timeout())
            .context("failed to create registry client")?,
    );

    let resolver = InstanceResolver::new(
        registry,
        cluster.clone(),
        &config.workload_label_key,
        logger.clone(),
    )
    .with_concurrency(config.scan_concurrency);
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(topology),
        resolver,
        PolicySynthesizer::new(config.synthesizer_config()?),
        PolicyStore::new(config.policy_dir()),
        cluster,
    ));

    health_registry.set_healthy(components::STATIC_GRAPH).await;
    health_registry.set_ready(true).await;

    let shutdown = CancellationToken::new();
    let app_state = Arc::new(
        api::AppState::new(reconciler, health_registry.clone())
            .with_default_source(config.instance_source)
            .with_shutdown(shutdown.clone()),
    );

    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        joined = &mut api_handle => {
            logger.log_shutdown("API server stopped");
            joined??;
            return Ok(());
        }
    }

    // Stops any in-flight cycle, then lets the server drain
    shutdown.cancel();
    api_handle.await??;
    info!("Shutting down");

    Ok(())
}
