//! nfd-master - Node Feature Discovery master
//!
//! Receives feature and topology reports from the per-node workers over
//! gRPC and publishes them as node labels, annotations, extended resources
//! and NodeResourceTopology records.

use anyhow::{Context, Result};
use master_lib::{
    advertise_master,
    health::{components, HealthRegistry},
    locks::NodeLocks,
    observability::{MasterMetrics, StructuredLogger},
    proto::{LabelerServer, NodeTopologyServer},
    reconcile::LabelReconciler,
    store::{KubeNodeStore, KubeTopologyStore, NodeStore},
    PeerAuthenticator, Pruner, ReportingService,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const MASTER_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = MASTER_VERSION, "Starting nfd-master");

    let config = config::MasterConfig::load()?;
    info!(
        node_name = %config.node_name,
        tls = config.tls().is_some(),
        verify_node_name = config.verify_node_name,
        no_publish = config.no_publish,
        "Master configured"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let node_store: Arc<dyn NodeStore> = Arc::new(KubeNodeStore::new(client.clone()));
    let logger = StructuredLogger::new(&config.node_name);

    if config.prune {
        let pruner = Pruner::new(
            LabelReconciler::new(node_store, NodeLocks::new()),
            logger,
        );
        let pruned = pruner.prune().await?;
        info!(nodes = pruned, "Prune completed");
        return Ok(());
    }

    if !config.no_publish {
        let reconciler = LabelReconciler::new(node_store.clone(), NodeLocks::new());
        advertise_master(&reconciler, &config.node_name, MASTER_VERSION)
            .await
            .with_context(|| format!("failed to update master node '{}'", config.node_name))?;
    }

    let health_registry = HealthRegistry::new();
    health_registry.register(components::GRPC_SERVER).await;
    health_registry.register(components::NODE_STORE).await;
    health_registry.register(components::TOPOLOGY_STORE).await;

    let metrics = MasterMetrics::new().context("failed to register metrics")?;

    let service = Arc::new(ReportingService::new(
        config.service_config(),
        Arc::new(PeerAuthenticator::new(config.verify_node_name)),
        config.classifier()?,
        node_store,
        Arc::new(KubeTopologyStore::new(client)),
        metrics.clone(),
        health_registry.clone(),
    ));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.health_port, app_state));

    let mut server = Server::builder().timeout(config.request_timeout());
    if let Some(tls) = config.tls() {
        let cert = tokio::fs::read(&tls.cert_file)
            .await
            .with_context(|| format!("failed to read {}", tls.cert_file.display()))?;
        let key = tokio::fs::read(&tls.key_file)
            .await
            .with_context(|| format!("failed to read {}", tls.key_file.display()))?;
        let ca = tokio::fs::read(&tls.ca_file)
            .await
            .with_context(|| format!("failed to read {}", tls.ca_file.display()))?;

        server = server
            .tls_config(
                ServerTlsConfig::new()
                    .identity(Identity::from_pem(cert, key))
                    .client_ca_root(Certificate::from_pem(ca)),
            )
            .context("invalid TLS configuration")?;
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let grpc = server
        .add_service(LabelerServer::from_arc(service.clone()))
        .add_service(NodeTopologyServer::from_arc(service))
        .serve_with_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        });

    logger.log_startup(MASTER_VERSION, config.port, !config.no_publish);
    health_registry.set_ready(true);

    let result = grpc.await.context("gRPC server failed");
    health_registry.set_ready(false);
    api_handle.abort();

    match &result {
        Ok(()) => logger.log_shutdown("SIGINT received"),
        Err(e) => logger.log_shutdown(&format!("{:#}", e)),
    }
    result
}
