use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey as DalekVerifyingKey};
use serde::{Deserialize, Serialize};
use serde_cbor::to_vec;
use sha2::{Digest, Sha256};

use crate::errors::{ApplyError, KeyError};

/// Previous-hash value carried by the first entry of every key's chain.
pub const GENESIS_HASH: &str = "GENESIS";

/// Position of a command in the replicated log.
pub type CommitPosition = u64;

/// Identity of a replica as known to the consensus engine.
pub type NodeId = String;

/// One index-commit entry, as carried in a command payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyIndexEntry {
    pub key_id: String,
    pub index: u64,
    pub previous_hash: String,
    pub hash: String,
    pub signature: String,
    pub public_key: String,
}

impl KeyIndexEntry {
    /// Parse a JSON command payload.
    pub fn from_json(raw: &[u8]) -> Result<Self, ApplyError> {
        let entry: KeyIndexEntry = serde_json::from_slice(raw).map_err(|e| ApplyError::MalformedCommand(e.to_string()))?;
        if entry.key_id.is_empty() {
            return Err(ApplyError::MalformedCommand("empty key_id".into()));
        }
        Ok(entry)
    }

    /// Serialize to the JSON command payload.
    pub fn to_json(&self) -> Result<String, serde_json::Error> { serde_json::to_string(self) }

    /// Decode the base64 signature field.
    pub fn decode_signature(&self) -> Result<Signature, ApplyError> {
        let bytes = B64.decode(self.signature.as_bytes()).map_err(|_| ApplyError::MalformedCommand("signature base64".into()))?;
        Signature::from_slice(&bytes).map_err(|_| ApplyError::MalformedCommand("signature length".into()))
    }

    /// Decode the base64 public key field.
    pub fn decode_public_key(&self) -> Result<DalekVerifyingKey, ApplyError> {
        decode_public_key(&self.public_key).map_err(|e| ApplyError::MalformedCommand(format!("public_key: {e}")))
    }
}

/// The exact byte string the issuer signs for `(key_id, index)`.
pub fn signing_message(key_id: &str, index: u64) -> String { format!("{key_id}:{index}") }

/// Canonicalize an entry for hashing (every field except `hash`).
pub fn cbor_for_hash(e: &KeyIndexEntry) -> Vec<u8> {
    to_vec(&(&e.key_id, e.index, &e.previous_hash, &e.signature, &e.public_key))
        .expect("CBOR serialization of a string/integer tuple cannot fail")
}

/// Compute hex-encoded SHA-256 of the canonical CBOR tuple.
pub fn compute_entry_hash(e: &KeyIndexEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cbor_for_hash(e));
    hex::encode(hasher.finalize())
}

/// Decode a base64 Ed25519 public key.
pub fn decode_public_key(encoded: &str) -> Result<DalekVerifyingKey, KeyError> {
    let bytes = B64.decode(encoded.as_bytes()).map_err(|_| KeyError::Encoding)?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| KeyError::Length(bytes.len()))?;
    DalekVerifyingKey::from_bytes(&arr).map_err(|_| KeyError::Point)
}

/// The single authorized issuer key. Loaded once at construction, never mutated.
#[derive(Clone, Debug)]
pub struct IssuerKey {
    key: DalekVerifyingKey,
}

impl IssuerKey {
    /// Build from a base64 encoded 32-byte Ed25519 public key.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> { Ok(Self { key: decode_public_key(encoded)? }) }

    pub fn from_verifying_key(key: DalekVerifyingKey) -> Self { Self { key } }

    pub fn verifying_key(&self) -> &DalekVerifyingKey { &self.key }

    /// Base64 form, as it appears in the `public_key` field of entries.
    pub fn to_base64(&self) -> String { B64.encode(self.key.to_bytes()) }

    /// Compare on decoded key bytes so encoding variants cannot slip through.
    pub fn is(&self, other: &DalekVerifyingKey) -> bool { self.key.as_bytes() == other.as_bytes() }
}

/// Latest accepted state for a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainHead {
    pub key_id: String,
    pub index: u64,
    pub hash: String,
    pub position: CommitPosition,
}

/// An accepted entry together with the log position it committed at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainEntry {
    pub position: CommitPosition,
    pub entry: KeyIndexEntry,
}

/// Chain listing row with its recomputed validity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainEntryView {
    pub position: CommitPosition,
    pub entry: KeyIndexEntry,
    pub valid: bool,
}

/// Confirmation that an entry was accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitReceipt {
    pub key_id: String,
    pub index: u64,
    pub hash: String,
    pub position: CommitPosition,
}

/// Per-outcome apply counters. Derived only from the log, so identical on every replica.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyStats {
    pub accepted: u64,
    pub malformed: u64,
    pub signature_invalid: u64,
    pub chain_broken: u64,
    pub hash_mismatch: u64,
    pub index_not_monotonic: u64,
    pub stale: u64,
}

impl ApplyStats {
    pub(crate) fn record_rejection(&mut self, err: &ApplyError) {
        match err {
            ApplyError::MalformedCommand(_) => self.malformed += 1,
            ApplyError::SignatureInvalid(_) => self.signature_invalid += 1,
            ApplyError::ChainBroken { .. } => self.chain_broken += 1,
            ApplyError::HashMismatch { .. } => self.hash_mismatch += 1,
            ApplyError::IndexNotMonotonic { .. } => self.index_not_monotonic += 1,
            ApplyError::StalePosition { .. } => self.stale += 1,
        }
    }

    pub fn rejected(&self) -> u64 {
        self.malformed + self.signature_invalid + self.chain_broken + self.hash_mismatch + self.index_not_monotonic + self.stale
    }
}
