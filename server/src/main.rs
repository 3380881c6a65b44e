//! Key index replica.
//!
//! Hosts the state machine and the leader forwarding gateway behind HTTP.
//! Log replication belongs to the consensus engine; this binary embeds the
//! in-process log, so followers act as forwarding frontends for the leader.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use keyindex_core::{Gateway, IssuerKey, KeyIndexStateMachine, LocalCluster};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod transport;

use config::NodeConfig;
use transport::HttpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("KEYINDEX_CONFIG").ok())
        .context("usage: keyindex-server <config.json> (or set KEYINDEX_CONFIG)")?
        .into();
    let cfg = NodeConfig::load(&path)?;
    let issuer = IssuerKey::from_base64(&cfg.issuer_public_key).context("issuer_public_key")?;

    let machine = Arc::new(KeyIndexStateMachine::new(issuer));
    let cluster = LocalCluster::new();
    let log = cluster.join(cfg.node_id.clone(), Arc::clone(&machine));
    cluster.set_leader(cfg.effective_leader());

    let gateway_cfg = cfg.gateway_config();
    let transport = Arc::new(HttpTransport::new(cfg.peers.clone(), gateway_cfg.propose_timeout)?);
    let gateway = Arc::new(Gateway::new(Arc::new(log), machine, transport, gateway_cfg));
    let app = api::router(gateway);

    let listener = TcpListener::bind(cfg.listen_addr).await.with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!(node_id = %cfg.node_id, listen_addr = %cfg.listen_addr, leader = ?cfg.effective_leader(), peers = cfg.peers.len(), "keyindex-server listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    info!("keyindex-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
