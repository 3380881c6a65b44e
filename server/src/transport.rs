use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use keyindex_core::{GatewayError, GatewayRequest, GatewayResponse, LeaderTransport, NodeId};
use reqwest::Client;
use tracing::debug;

/// Relays gateway requests to the leader's `/internal/forward` endpoint.
pub struct HttpTransport {
    client: Client,
    peers: BTreeMap<NodeId, String>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(peers: BTreeMap<NodeId, String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, peers, timeout })
    }

    fn classify(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout { after_ms: self.timeout.as_millis() as u64 }
        } else if err.is_connect() {
            // nothing reached the leader
            GatewayError::Unavailable(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl LeaderTransport for HttpTransport {
    async fn forward(&self, leader: &str, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let base = self
            .peers
            .get(leader)
            .ok_or_else(|| GatewayError::Unavailable(format!("no address for leader {leader}")))?;
        let url = format!("{}/internal/forward", base.trim_end_matches('/'));
        debug!(leader, url = %url, "forwarding to leader");
        let resp = self.client.post(&url).json(&request).send().await.map_err(|e| self.classify(e))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.classify(e))?;
        debug!(leader, %status, "leader replied");
        decode_reply(&body)
    }
}

/// The leader's reply, success or error, is passed back unchanged whatever the HTTP status.
fn decode_reply(body: &[u8]) -> Result<GatewayResponse, GatewayError> {
    serde_json::from_slice::<Result<GatewayResponse, GatewayError>>(body)
        .map_err(|e| GatewayError::Transport(format!("undecodable leader reply: {e}")))?
}
