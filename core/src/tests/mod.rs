use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;

use crate::gateway::{Gateway, GatewayConfig, LocalTransport};
use crate::replicated_log::LocalCluster;
use crate::state_machine::KeyIndexStateMachine;
use crate::traits::MaterialShredder;
use crate::types::{compute_entry_hash, signing_message, IssuerKey, KeyIndexEntry};

mod forwarding;

const ISSUER_SECRET: [u8; 32] = [42u8; 32];

fn issuer_sk() -> SigningKey { SigningKey::from_bytes(&ISSUER_SECRET) }

fn issuer() -> IssuerKey { IssuerKey::from_verifying_key(issuer_sk().verifying_key()) }

fn machine() -> Arc<KeyIndexStateMachine> { Arc::new(KeyIndexStateMachine::new(issuer())) }

fn make_entry(sk: &SigningKey, key_id: &str, index: u64, prev: &str) -> KeyIndexEntry {
    let sig = sk.sign(signing_message(key_id, index).as_bytes());
    let mut e = KeyIndexEntry {
        key_id: key_id.into(),
        index,
        previous_hash: prev.into(),
        hash: String::new(),
        signature: B64.encode(sig.to_bytes()),
        public_key: B64.encode(sk.verifying_key().to_bytes()),
    };
    // hash covers every other field, signature included
    e.hash = compute_entry_hash(&e);
    e
}

fn raw(e: &KeyIndexEntry) -> Vec<u8> { e.to_json().unwrap().into_bytes() }

/// Records every destroyed (key_id, index).
#[derive(Default)]
struct RecordingShredder {
    destroyed: Mutex<Vec<(String, u64)>>,
}

impl RecordingShredder {
    fn destroyed(&self) -> Vec<(String, u64)> { self.destroyed.lock().clone() }
}

impl MaterialShredder for RecordingShredder {
    fn destroy(&self, key_id: &str, index: u64) { self.destroyed.lock().push((key_id.to_string(), index)); }
}

struct TestCluster {
    log: Arc<LocalCluster>,
    transport: Arc<LocalTransport>,
    gateways: Vec<Arc<Gateway>>,
}

impl TestCluster {
    /// `n` replicas named n1..=n{n}, n1 leading.
    fn new(n: usize) -> Self { Self::with_config(n, GatewayConfig::default()) }

    fn with_config(n: usize, config: GatewayConfig) -> Self {
        let log = LocalCluster::new();
        let transport = LocalTransport::new();
        let gateways: Vec<Arc<Gateway>> = (1..=n)
            .map(|i| {
                let sm = machine();
                let node = log.join(format!("n{i}"), Arc::clone(&sm));
                let gw = Arc::new(Gateway::new(Arc::new(node), sm, transport.clone(), config.clone()));
                transport.register(&gw);
                gw
            })
            .collect();
        log.set_leader(Some("n1".into()));
        Self { log, transport, gateways }
    }

    fn gateway(&self, i: usize) -> Arc<Gateway> { Arc::clone(&self.gateways[i]) }
}

fn short_config() -> GatewayConfig {
    GatewayConfig { propose_timeout: Duration::from_millis(200), query_timeout: Duration::from_millis(200) }
}
