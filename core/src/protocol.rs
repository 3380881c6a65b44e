//! Device-side protocol for consuming one-time-signature indices.
//!
//! A device syncs the chain head from the cluster, picks the next index it
//! may use, signs an entry for it and proposes it. Any outcome other than a
//! confirmed commit retires the index for good: the index goes into
//! `unusable_indices` and the one-time material behind it is destroyed
//! before anything else happens. A timeout is treated the same as a
//! rejection, since the entry may have committed anyway.
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey as DalekVerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{DiscardCause, ProtocolError};
use crate::traits::{AttestationSigner, IndexService, MaterialShredder};
use crate::types::{compute_entry_hash, signing_message, CommitPosition, CommitReceipt, KeyIndexEntry, GENESIS_HASH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolPhase {
    Uninitialized,
    Synced,
    Proposing,
    Committed,
    Discarded,
}

/// Per-device, per-key protocol state. Serializable so a device can persist its discards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolState {
    /// Last index known committed; `None` before the first commit for the key.
    pub current_index: Option<u64>,
    /// Number of commit attempts made.
    pub sequence_number: u64,
    /// Retired indices. Only ever grows.
    pub unusable_indices: BTreeSet<u64>,
    pub last_known_hash: String,
    pub last_seen_commit_position: Option<CommitPosition>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self {
            current_index: None,
            sequence_number: 0,
            unusable_indices: BTreeSet::new(),
            last_known_hash: GENESIS_HASH.to_string(),
            last_seen_commit_position: None,
            last_synced_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub key_id: String,
    pub commit_timeout: Duration,
    /// Highest index the one-time key can produce.
    pub max_index: u64,
    /// Attempts `attest` makes when it keeps losing races.
    pub max_attempts: u32,
}

impl ClientConfig {
    pub fn new(key_id: impl Into<String>) -> Self {
        Self { key_id: key_id.into(), commit_timeout: Duration::from_secs(5), max_index: u64::MAX, max_attempts: 3 }
    }
}

/// A signed entry ready for submission, bound to the message it attests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedAttestation {
    pub entry: KeyIndexEntry,
    pub message_digest: Vec<u8>,
}

/// Ed25519 issuer signer.
pub struct Ed25519IssuerSigner {
    sk: SigningKey,
}

impl Ed25519IssuerSigner {
    pub fn from_secret_key(secret_key: [u8; 32]) -> Self { Self { sk: SigningKey::from_bytes(&secret_key) } }

    pub fn verifying_key(&self) -> DalekVerifyingKey { self.sk.verifying_key() }
}

impl AttestationSigner for Ed25519IssuerSigner {
    fn public_key(&self) -> String { B64.encode(self.sk.verifying_key().to_bytes()) }
    fn sign(&self, msg: &[u8]) -> Vec<u8> { self.sk.sign(msg).to_bytes().to_vec() }
}

pub struct HsmClient {
    config: ClientConfig,
    service: Arc<dyn IndexService>,
    signer: Arc<dyn AttestationSigner>,
    shredder: Arc<dyn MaterialShredder>,
    state: ProtocolState,
    phase: ProtocolPhase,
}

impl HsmClient {
    pub fn new(
        config: ClientConfig,
        service: Arc<dyn IndexService>,
        signer: Arc<dyn AttestationSigner>,
        shredder: Arc<dyn MaterialShredder>,
    ) -> Self {
        Self::with_state(config, service, signer, shredder, ProtocolState::default())
    }

    /// Resume from persisted state. The client still has to sync before use.
    pub fn with_state(
        config: ClientConfig,
        service: Arc<dyn IndexService>,
        signer: Arc<dyn AttestationSigner>,
        shredder: Arc<dyn MaterialShredder>,
        state: ProtocolState,
    ) -> Self {
        Self { config, service, signer, shredder, state, phase: ProtocolPhase::Uninitialized }
    }

    pub fn key_id(&self) -> &str { &self.config.key_id }

    pub fn state(&self) -> &ProtocolState { &self.state }

    pub fn phase(&self) -> ProtocolPhase { self.phase }

    /// Refresh the head from the cluster, which is the source of truth.
    pub async fn sync_state(&mut self) -> Result<(), ProtocolError> {
        let head = self.service.fetch_head(&self.config.key_id).await.map_err(ProtocolError::Unavailable)?;
        match head {
            Some(head) => {
                self.state.current_index = Some(head.index);
                self.state.last_known_hash = head.hash;
                self.state.last_seen_commit_position = Some(head.position);
            }
            None => {
                self.state.current_index = None;
                self.state.last_known_hash = GENESIS_HASH.to_string();
                self.state.last_seen_commit_position = None;
            }
        }
        self.state.last_synced_at = Some(Utc::now());
        self.phase = ProtocolPhase::Synced;
        debug!(key_id = %self.config.key_id, current_index = ?self.state.current_index, "synced");
        Ok(())
    }

    /// `current_index + 1`, stepping over retired indices.
    pub fn next_usable_index(&self) -> Result<u64, ProtocolError> {
        self.require_synced()?;
        let exhausted = || ProtocolError::IndicesExhausted(self.config.key_id.clone());
        let mut candidate = match self.state.current_index {
            Some(i) => i.checked_add(1).ok_or_else(exhausted)?,
            None => 0,
        };
        while self.state.unusable_indices.contains(&candidate) {
            candidate = candidate.checked_add(1).ok_or_else(exhausted)?;
        }
        if candidate > self.config.max_index {
            return Err(exhausted());
        }
        Ok(candidate)
    }

    /// Sign an entry for `next_index` linked to the last known hash.
    pub fn build_entry(&self, next_index: u64, message_digest: &[u8]) -> Result<PreparedAttestation, ProtocolError> {
        self.require_synced()?;
        if self.state.unusable_indices.contains(&next_index) {
            return Err(ProtocolError::IndexUnusable(next_index));
        }
        let key_id = self.config.key_id.clone();
        let signature = B64.encode(self.signer.sign(signing_message(&key_id, next_index).as_bytes()));
        let mut entry = KeyIndexEntry {
            key_id,
            index: next_index,
            previous_hash: self.state.last_known_hash.clone(),
            hash: String::new(),
            signature,
            public_key: self.signer.public_key(),
        };
        entry.hash = compute_entry_hash(&entry);
        Ok(PreparedAttestation { entry, message_digest: message_digest.to_vec() })
    }

    /// Submit `prepared`. Anything but a confirmed commit discards its index.
    pub async fn commit_attestation(
        &mut self,
        prepared: PreparedAttestation,
        timeout: Duration,
    ) -> Result<CommitReceipt, ProtocolError> {
        let index = prepared.entry.index;
        if self.state.unusable_indices.contains(&index) {
            return Err(ProtocolError::IndexUnusable(index));
        }
        self.phase = ProtocolPhase::Proposing;
        self.state.sequence_number += 1;
        let command = match prepared.entry.to_json() {
            Ok(command) => command,
            Err(e) => return Err(self.discard(index, DiscardCause::Encoding(e.to_string()))),
        };
        let outcome = tokio::time::timeout(timeout, self.service.propose(command)).await;
        match outcome {
            Ok(Ok(receipt)) => {
                self.state.current_index = Some(receipt.index);
                self.state.last_known_hash = receipt.hash.clone();
                self.state.last_seen_commit_position = Some(receipt.position);
                self.phase = ProtocolPhase::Committed;
                info!(key_id = %receipt.key_id, index = receipt.index, position = receipt.position, "index committed");
                Ok(receipt)
            }
            Ok(Err(e)) => Err(self.discard(index, DiscardCause::Gateway(e))),
            Err(_) => Err(self.discard(index, DiscardCause::Timeout { after_ms: timeout.as_millis() as u64 })),
        }
    }

    /// Sync, pick, build and commit, retrying with a fresh index when a race is lost.
    pub async fn attest(&mut self, message_digest: &[u8]) -> Result<CommitReceipt, ProtocolError> {
        let timeout = self.config.commit_timeout;
        for attempt in 1..=self.config.max_attempts {
            self.sync_state().await?;
            let index = self.next_usable_index()?;
            let prepared = self.build_entry(index, message_digest)?;
            match self.commit_attestation(prepared, timeout).await {
                Ok(receipt) => return Ok(receipt),
                Err(ProtocolError::Discarded { cause, .. }) if cause.is_lost_race() => {
                    debug!(attempt, index, "lost race, retrying with a fresh index");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProtocolError::AttemptsExhausted(self.config.max_attempts))
    }

    /// Local state is stale before the first sync and after any discard.
    fn require_synced(&self) -> Result<(), ProtocolError> {
        match self.phase {
            ProtocolPhase::Uninitialized | ProtocolPhase::Discarded => Err(ProtocolError::NotSynced),
            _ => Ok(()),
        }
    }

    fn discard(&mut self, index: u64, cause: DiscardCause) -> ProtocolError {
        self.state.unusable_indices.insert(index);
        self.shredder.destroy(&self.config.key_id, index);
        self.phase = ProtocolPhase::Discarded;
        warn!(key_id = %self.config.key_id, index, cause = %cause, "index discarded");
        ProtocolError::Discarded { index, cause }
    }
}
