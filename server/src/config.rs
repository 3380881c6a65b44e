use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use keyindex_core::{GatewayConfig, NodeId};
use serde::Deserialize;

/// Replica configuration, read once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Base64 Ed25519 key of the single authorized issuer.
    pub issuer_public_key: String,
    /// Other replicas: node id -> base URL.
    #[serde(default)]
    pub peers: BTreeMap<NodeId, String>,
    #[serde(default)]
    pub leader: Option<NodeId>,
    #[serde(default = "default_propose_timeout_ms")]
    pub propose_timeout_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_listen_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8080)) }
fn default_propose_timeout_ms() -> u64 { 5_000 }
fn default_query_timeout_ms() -> u64 { 2_000 }

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let cfg: NodeConfig = serde_json::from_str(raw).context("invalid node config JSON")?;
        if cfg.node_id.is_empty() {
            bail!("node_id must not be empty");
        }
        if cfg.peers.contains_key(&cfg.node_id) {
            bail!("peers must not list this node ({})", cfg.node_id);
        }
        if let Some(leader) = &cfg.leader {
            if leader != &cfg.node_id && !cfg.peers.contains_key(leader) {
                bail!("leader {leader} is neither this node nor a configured peer");
            }
        }
        Ok(cfg)
    }

    /// A node without peers leads itself unless told otherwise.
    pub fn effective_leader(&self) -> Option<NodeId> {
        self.leader.clone().or_else(|| self.peers.is_empty().then(|| self.node_id.clone()))
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            propose_timeout: Duration::from_millis(self.propose_timeout_ms),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
        }
    }
}
