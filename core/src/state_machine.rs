use std::collections::BTreeMap;

use ed25519_dalek::Verifier as _;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ApplyError;
use crate::types::{
    compute_entry_hash, signing_message, ApplyStats, ChainEntry, ChainEntryView, ChainHead, CommitPosition,
    CommitReceipt, IssuerKey, KeyIndexEntry, GENESIS_HASH,
};

/// Chain state for one key id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct KeyChain {
    last_index: u64,
    /// Copied from the accepted entry at commit time; never recomputed.
    last_hash: String,
    last_position: CommitPosition,
    entries: Vec<ChainEntry>,
}

/// Full replicated state. `BTreeMap` keeps iteration order identical across replicas.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSnapshot {
    applied_position: Option<CommitPosition>,
    chains: BTreeMap<String, KeyChain>,
    /// (key_id, slot in that key's entries) in commit order.
    commit_order: Vec<(String, usize)>,
    stats: ApplyStats,
}

impl StateSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> { serde_json::to_vec(self) }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> { serde_json::from_slice(raw) }

    pub fn applied_position(&self) -> Option<CommitPosition> { self.applied_position }
}

/// Deterministic state machine applying key index commands in log order.
///
/// `apply` takes the write lock; queries share the read lock, so reads never
/// observe a half-applied command.
pub struct KeyIndexStateMachine {
    issuer: IssuerKey,
    state: RwLock<StateSnapshot>,
}

impl KeyIndexStateMachine {
    /// Create an empty state machine trusting only `issuer`.
    pub fn new(issuer: IssuerKey) -> Self { Self { issuer, state: RwLock::new(StateSnapshot::default()) } }

    pub fn issuer(&self) -> &IssuerKey { &self.issuer }

    /// Apply the command committed at `position`.
    pub fn apply(&self, position: CommitPosition, raw: &[u8]) -> Result<CommitReceipt, ApplyError> {
        let mut state = self.state.write();
        if let Some(applied) = state.applied_position {
            if position <= applied {
                let err = ApplyError::StalePosition { position, applied };
                state.stats.record_rejection(&err);
                return Err(err);
            }
        }
        state.applied_position = Some(position);

        let entry = match self.validate(&state, raw) {
            Ok(entry) => entry,
            Err(err) => {
                state.stats.record_rejection(&err);
                match &err {
                    ApplyError::SignatureInvalid(reason) => warn!(position, %reason, "rejected command: potential unauthorized write"),
                    other => warn!(position, error = %other, "rejected command"),
                }
                return Err(err);
            }
        };

        let receipt = CommitReceipt { key_id: entry.key_id.clone(), index: entry.index, hash: entry.hash.clone(), position };
        let key_id = entry.key_id.clone();
        let chain = state.chains.entry(key_id.clone()).or_insert_with(|| KeyChain {
            last_index: 0,
            last_hash: String::new(),
            last_position: position,
            entries: Vec::new(),
        });
        // explicit copy of the accepted hash; the next link is checked against this value
        chain.last_index = entry.index;
        chain.last_hash = entry.hash.clone();
        chain.last_position = position;
        chain.entries.push(ChainEntry { position, entry });
        let slot = chain.entries.len() - 1;
        state.commit_order.push((key_id, slot));
        state.stats.accepted += 1;
        debug!(key_id = %receipt.key_id, index = receipt.index, position, "accepted entry");
        Ok(receipt)
    }

    fn validate(&self, state: &StateSnapshot, raw: &[u8]) -> Result<KeyIndexEntry, ApplyError> {
        // 1) Parse
        let entry = KeyIndexEntry::from_json(raw)?;
        let signature = entry.decode_signature()?;
        let public_key = entry.decode_public_key()?;

        // 2) Signature, then signer authorization
        let msg = signing_message(&entry.key_id, entry.index);
        public_key
            .verify(msg.as_bytes(), &signature)
            .map_err(|_| ApplyError::SignatureInvalid("verification failed".into()))?;
        if !self.issuer.is(&public_key) {
            return Err(ApplyError::SignatureInvalid("signer is not the authorized issuer".into()));
        }

        // 3) Chain linkage against the stored hash
        let chain = state.chains.get(&entry.key_id);
        let expected = chain.map_or(GENESIS_HASH, |c| c.last_hash.as_str());
        if entry.previous_hash != expected {
            return Err(ApplyError::ChainBroken { expected: expected.to_string(), got: entry.previous_hash.clone() });
        }

        // 4) Hash
        let computed = compute_entry_hash(&entry);
        if computed != entry.hash {
            return Err(ApplyError::HashMismatch { computed, supplied: entry.hash.clone() });
        }

        // 5) Strictly increasing index; gaps are legal
        if let Some(c) = chain {
            if entry.index <= c.last_index {
                return Err(ApplyError::IndexNotMonotonic { recorded: c.last_index, got: entry.index });
            }
        }
        Ok(entry)
    }

    pub fn get_index(&self, key_id: &str) -> Option<u64> { self.state.read().chains.get(key_id).map(|c| c.last_index) }

    pub fn get_hash(&self, key_id: &str) -> Option<String> { self.state.read().chains.get(key_id).map(|c| c.last_hash.clone()) }

    /// Index, hash and position of the latest accepted entry, read atomically.
    pub fn get_head(&self, key_id: &str) -> Option<ChainHead> {
        self.state.read().chains.get(key_id).map(|c| ChainHead {
            key_id: key_id.to_string(),
            index: c.last_index,
            hash: c.last_hash.clone(),
            position: c.last_position,
        })
    }

    /// Entries for `key_id` in commit order, each re-checked for hash and link validity.
    pub fn get_chain(&self, key_id: &str) -> Vec<ChainEntryView> {
        let state = self.state.read();
        let Some(chain) = state.chains.get(key_id) else { return Vec::new() };
        let mut prev = GENESIS_HASH;
        chain
            .entries
            .iter()
            .map(|c| {
                let valid = compute_entry_hash(&c.entry) == c.entry.hash && c.entry.previous_hash == prev;
                prev = c.entry.hash.as_str();
                ChainEntryView { position: c.position, entry: c.entry.clone(), valid }
            })
            .collect()
    }

    /// Every key id with at least one accepted entry, sorted.
    pub fn get_all_keys(&self) -> Vec<String> { self.state.read().chains.keys().cloned().collect() }

    /// Up to `limit` accepted entries, newest commit first.
    pub fn get_entries_ordered_by_commit_position(&self, limit: usize) -> Vec<ChainEntry> {
        let state = self.state.read();
        state
            .commit_order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|(key_id, slot)| state.chains.get(key_id).and_then(|c| c.entries.get(*slot)).cloned())
            .collect()
    }

    pub fn applied_position(&self) -> Option<CommitPosition> { self.state.read().applied_position }

    pub fn stats(&self) -> ApplyStats { self.state.read().stats.clone() }

    /// Copy of the full state for the consensus engine's snapshotting.
    pub fn snapshot(&self) -> StateSnapshot { self.state.read().clone() }

    /// Replace the full state with an engine-provided snapshot.
    pub fn restore(&self, snapshot: StateSnapshot) {
        let mut state = self.state.write();
        debug!(applied_position = ?snapshot.applied_position, keys = snapshot.chains.len(), "restoring snapshot");
        *state = snapshot;
    }
}
