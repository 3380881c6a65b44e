//! Key index core: fault-tolerant tracking of one-time-signature key indices.
//!
//! - JSON command payloads, CBOR canonicalization for hashing
//! - SHA-256 entry hashing (hex-encoded), linked per key id from a genesis sentinel
//! - Ed25519 signatures over `"<key_id>:<index>"`, accepted only from the configured issuer
//! - A deterministic state machine applied in log order on every replica
//! - A leader forwarding gateway over a pluggable replicated log and transport
//! - The device-side protocol that retires any index whose commit is not confirmed

pub mod errors;
pub mod gateway;
pub mod protocol;
pub mod replicated_log;
pub mod state_machine;
pub mod traits;
pub mod types;

pub use errors::{ApplyError, DiscardCause, GatewayError, KeyError, LogError, ProtocolError};
pub use gateway::{Gateway, GatewayConfig, GatewayRequest, GatewayResponse, LocalTransport};
pub use protocol::{ClientConfig, Ed25519IssuerSigner, HsmClient, PreparedAttestation, ProtocolPhase, ProtocolState};
pub use replicated_log::{LocalCluster, LocalLog};
pub use state_machine::{KeyIndexStateMachine, StateSnapshot};
pub use traits::{AppliedCommand, AttestationSigner, IndexService, LeaderTransport, MaterialShredder, ReplicatedLog};
pub use types::{
    ApplyStats, ChainEntry, ChainEntryView, ChainHead, CommitPosition, CommitReceipt, IssuerKey, KeyIndexEntry, NodeId,
    GENESIS_HASH,
};

/// Library version string.
pub fn version() -> &'static str { concat!("keyindex-core ", env!("CARGO_PKG_VERSION")) }

#[cfg(test)]
mod tests;
