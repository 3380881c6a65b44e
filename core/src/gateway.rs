//! Leader forwarding gateway.
//!
//! Every replica runs a `Gateway`. The leader serves requests from its own
//! state machine and log; a follower relays them to the leader it learned
//! about from the consensus engine and passes the leader's reply back as-is.
//! With no leader known the gateway fails fast with `GatewayError::NoLeader`.
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::errors::{GatewayError, LogError};
use crate::state_machine::KeyIndexStateMachine;
use crate::traits::{IndexService, LeaderTransport, ReplicatedLog};
use crate::types::{ChainEntry, ChainEntryView, ChainHead, CommitReceipt, NodeId};

/// Upper bound on `GetEntries` page size.
pub const MAX_ENTRIES_LIMIT: usize = 1000;

/// Request surface shared by clients and forwarding peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GatewayRequest {
    GetIndex { key_id: String },
    GetHash { key_id: String },
    GetHead { key_id: String },
    GetChain { key_id: String },
    GetAllKeys,
    GetEntries { limit: usize },
    /// JSON encoded `KeyIndexEntry`.
    Propose { command: String },
}

impl GatewayRequest {
    pub fn is_propose(&self) -> bool { matches!(self, GatewayRequest::Propose { .. }) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GatewayResponse {
    Index(Option<u64>),
    Hash(Option<String>),
    Head(Option<ChainHead>),
    Chain(Vec<ChainEntryView>),
    Keys(Vec<String>),
    Entries(Vec<ChainEntry>),
    Committed(CommitReceipt),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long a propose (local or forwarded) may block before it is reported as ambiguous.
    pub propose_timeout: Duration,
    /// Bound on forwarded reads.
    pub query_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self { Self { propose_timeout: Duration::from_secs(5), query_timeout: Duration::from_secs(2) } }
}

pub struct Gateway {
    log: Arc<dyn ReplicatedLog>,
    machine: Arc<KeyIndexStateMachine>,
    transport: Arc<dyn LeaderTransport>,
    leader: watch::Receiver<Option<NodeId>>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        log: Arc<dyn ReplicatedLog>,
        machine: Arc<KeyIndexStateMachine>,
        transport: Arc<dyn LeaderTransport>,
        config: GatewayConfig,
    ) -> Self {
        let leader = log.leader_updates();
        Self { log, machine, transport, leader, config }
    }

    pub fn node_id(&self) -> &str { self.log.node_id() }

    /// Leader as last announced by the consensus engine.
    pub fn known_leader(&self) -> Option<NodeId> { self.leader.borrow().clone() }

    pub fn machine(&self) -> &Arc<KeyIndexStateMachine> { &self.machine }

    /// Serve a client request, forwarding to the leader when this node is not it.
    pub async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        if self.log.is_leader() {
            return self.serve_local(request).await;
        }
        let leader = match self.known_leader() {
            Some(leader) if leader != self.node_id() => leader,
            _ => {
                warn!(node_id = %self.node_id(), "no leader known");
                return Err(GatewayError::NoLeader);
            }
        };
        debug!(node_id = %self.node_id(), leader = %leader, "forwarding request");
        let bound = if request.is_propose() { self.config.propose_timeout } else { self.config.query_timeout };
        match tokio::time::timeout(bound, self.transport.forward(&leader, request)).await {
            Ok(reply) => reply,
            Err(_) => Err(GatewayError::Timeout { after_ms: bound.as_millis() as u64 }),
        }
    }

    /// Serve a request relayed by a peer. Never forwards again, so stale leader views cannot loop.
    pub async fn handle_forwarded(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        if !self.log.is_leader() {
            return Err(GatewayError::NoLeader);
        }
        self.serve_local(request).await
    }

    async fn serve_local(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let m = &self.machine;
        Ok(match request {
            GatewayRequest::GetIndex { key_id } => GatewayResponse::Index(m.get_index(&key_id)),
            GatewayRequest::GetHash { key_id } => GatewayResponse::Hash(m.get_hash(&key_id)),
            GatewayRequest::GetHead { key_id } => GatewayResponse::Head(m.get_head(&key_id)),
            GatewayRequest::GetChain { key_id } => GatewayResponse::Chain(m.get_chain(&key_id)),
            GatewayRequest::GetAllKeys => GatewayResponse::Keys(m.get_all_keys()),
            GatewayRequest::GetEntries { limit } => {
                GatewayResponse::Entries(m.get_entries_ordered_by_commit_position(limit.min(MAX_ENTRIES_LIMIT)))
            }
            GatewayRequest::Propose { command } => GatewayResponse::Committed(self.propose_local(command).await?),
        })
    }

    async fn propose_local(&self, command: String) -> Result<CommitReceipt, GatewayError> {
        let bound = self.config.propose_timeout;
        let applied = match tokio::time::timeout(bound, self.log.propose(command.into_bytes())).await {
            Ok(Ok(applied)) => applied,
            Ok(Err(LogError::NotLeader { .. })) => return Err(GatewayError::NoLeader),
            Ok(Err(LogError::Unavailable(reason))) => return Err(GatewayError::Unavailable(reason)),
            Err(_) => {
                warn!(after_ms = bound.as_millis() as u64, "propose timed out; outcome unknown");
                return Err(GatewayError::Timeout { after_ms: bound.as_millis() as u64 });
            }
        };
        applied.outcome.map_err(GatewayError::Rejected)
    }
}

#[async_trait]
impl IndexService for Gateway {
    async fn fetch_head(&self, key_id: &str) -> Result<Option<ChainHead>, GatewayError> {
        match self.handle(GatewayRequest::GetHead { key_id: key_id.to_string() }).await? {
            GatewayResponse::Head(head) => Ok(head),
            other => Err(unexpected(&other)),
        }
    }

    async fn propose(&self, command: String) -> Result<CommitReceipt, GatewayError> {
        match self.handle(GatewayRequest::Propose { command }).await? {
            GatewayResponse::Committed(receipt) => Ok(receipt),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &GatewayResponse) -> GatewayError {
    GatewayError::Transport(format!("unexpected response: {response:?}"))
}

/// Forwards between gateways living in the same process.
///
/// Peers are held weakly: each gateway already owns the transport, and a
/// dropped gateway simply becomes unreachable.
#[derive(Default)]
pub struct LocalTransport {
    peers: RwLock<HashMap<NodeId, Weak<Gateway>>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn register(&self, gateway: &Arc<Gateway>) {
        self.peers.write().insert(gateway.node_id().to_string(), Arc::downgrade(gateway));
    }

    pub fn unregister(&self, node_id: &str) { self.peers.write().remove(node_id); }
}

#[async_trait]
impl LeaderTransport for LocalTransport {
    async fn forward(&self, leader: &str, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let peer = self.peers.read().get(leader).and_then(Weak::upgrade);
        match peer {
            Some(gateway) => gateway.handle_forwarded(request).await,
            None => Err(GatewayError::Unavailable(format!("leader {leader} unreachable"))),
        }
    }
}
