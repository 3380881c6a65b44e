//! Seams between the key index core and its collaborators: the consensus
//! engine, the leader transport, and the device-side signing hardware.
use async_trait::async_trait;
use tokio::sync::watch;

use crate::errors::{ApplyError, GatewayError, LogError};
use crate::gateway::{GatewayRequest, GatewayResponse};
use crate::types::{ChainHead, CommitPosition, CommitReceipt, NodeId};

/// Result of a command that made it into the log and through the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCommand {
    pub position: CommitPosition,
    pub outcome: Result<CommitReceipt, ApplyError>,
}

/// Ordered, durable, majority-agreed command delivery. Provided by the consensus engine.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Identity of the local replica.
    fn node_id(&self) -> &str;
    /// Block until `payload` is committed and applied locally, or fail.
    async fn propose(&self, payload: Vec<u8>) -> Result<AppliedCommand, LogError>;
    fn is_leader(&self) -> bool;
    fn current_leader(&self) -> Option<NodeId>;
    /// Leader change notifications.
    fn leader_updates(&self) -> watch::Receiver<Option<NodeId>>;
}

/// Carries a gateway request to the leader and returns its reply untouched.
#[async_trait]
pub trait LeaderTransport: Send + Sync {
    async fn forward(&self, leader: &str, request: GatewayRequest) -> Result<GatewayResponse, GatewayError>;
}

/// What a signing device needs from the cluster.
#[async_trait]
pub trait IndexService: Send + Sync {
    /// Latest accepted head for `key_id`, `None` if nothing was committed yet.
    async fn fetch_head(&self, key_id: &str) -> Result<Option<ChainHead>, GatewayError>;
    /// Submit a JSON command payload.
    async fn propose(&self, command: String) -> Result<CommitReceipt, GatewayError>;
}

/// Issuer-side signer used by devices to authenticate entries.
pub trait AttestationSigner: Send + Sync {
    /// Base64 public key placed in each entry.
    fn public_key(&self) -> String;
    fn sign(&self, msg: &[u8]) -> Vec<u8>;
}

/// Destroys the one-time signing material bound to an index.
pub trait MaterialShredder: Send + Sync {
    fn destroy(&self, key_id: &str, index: u64);
}
