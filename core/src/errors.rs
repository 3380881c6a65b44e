use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CommitPosition, NodeId};

/// Reasons the state machine refuses a command. Rejections never mutate state.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyError {
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("chain broken: expected previous hash {expected}, got {got}")]
    ChainBroken { expected: String, got: String },
    #[error("hash mismatch: computed {computed}, supplied {supplied}")]
    HashMismatch { computed: String, supplied: String },
    #[error("index not monotonic: {got} <= recorded {recorded}")]
    IndexNotMonotonic { recorded: u64, got: u64 },
    #[error("stale log position {position}, already applied up to {applied}")]
    StalePosition { position: CommitPosition, applied: CommitPosition },
}

impl ApplyError {
    /// True for rejections a client resolves by resyncing and picking a fresh index.
    pub fn is_lost_race(&self) -> bool {
        matches!(self, ApplyError::IndexNotMonotonic { .. } | ApplyError::ChainBroken { .. })
    }
}

/// Errors decoding Ed25519 key material.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is not valid base64")]
    Encoding,
    #[error("ed25519 public key must be 32 bytes, got {0}")]
    Length(usize),
    #[error("bytes are not a valid ed25519 point")]
    Point,
}

/// Failures reported by the replicated log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("node is not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    #[error("log unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the gateway. Serializable so a forwarded reply can be relayed verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayError {
    #[error("no leader known")]
    NoLeader,
    #[error("no confirmation within {after_ms}ms; outcome unknown")]
    Timeout { after_ms: u64 },
    #[error("rejected: {0}")]
    Rejected(ApplyError),
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl GatewayError {
    /// True when the caller cannot tell whether the command was committed.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. } | GatewayError::Transport(_))
    }
}

/// Why an index was retired by the client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscardCause {
    #[error("commit timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("{0}")]
    Gateway(GatewayError),
    #[error("encoding: {0}")]
    Encoding(String),
}

impl DiscardCause {
    /// True when the cluster definitively rejected the entry because another writer got there first.
    pub fn is_lost_race(&self) -> bool {
        matches!(self, DiscardCause::Gateway(GatewayError::Rejected(e)) if e.is_lost_race())
    }
}

/// Client protocol failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("state not synced with the cluster")]
    NotSynced,
    #[error("index {index} discarded: {cause}")]
    Discarded { index: u64, cause: DiscardCause },
    #[error("index {0} is unusable")]
    IndexUnusable(u64),
    #[error("no usable indices left for key {0}; provision a new key")]
    IndicesExhausted(String),
    #[error("gave up after {0} attempts")]
    AttemptsExhausted(u32),
    #[error("cluster unavailable: {0}")]
    Unavailable(GatewayError),
}
