//! In-process replicated log.
//!
//! `LocalCluster` holds one totally ordered command log and a set of replica
//! state machines. A commit appends to the log and applies the command to
//! every replica in attachment order before the proposer is answered, which
//! is the contract a real consensus engine gives once a majority has agreed.
//! Leader assignment is external (`set_leader`) and published on a watch
//! channel, standing in for the engine's leader notifications.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::errors::LogError;
use crate::state_machine::KeyIndexStateMachine;
use crate::traits::{AppliedCommand, ReplicatedLog};
use crate::types::{CommitPosition, NodeId};

struct Replica {
    node_id: NodeId,
    machine: Arc<KeyIndexStateMachine>,
}

#[derive(Default)]
struct LogInner {
    commands: Vec<Vec<u8>>,
    replicas: Vec<Replica>,
    online: bool,
}

/// Shared log and replica set.
pub struct LocalCluster {
    inner: Mutex<LogInner>,
    leader: watch::Sender<Option<NodeId>>,
    commit_delay: Mutex<Option<Duration>>,
    ack_delay: Mutex<Option<Duration>>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        let (leader, _) = watch::channel(None);
        Arc::new(Self {
            inner: Mutex::new(LogInner { online: true, ..Default::default() }),
            leader,
            commit_delay: Mutex::new(None),
            ack_delay: Mutex::new(None),
        })
    }

    /// Attach a replica. Commands already in the log are replayed into it first.
    pub fn join(self: &Arc<Self>, node_id: impl Into<NodeId>, machine: Arc<KeyIndexStateMachine>) -> LocalLog {
        let node_id = node_id.into();
        let mut inner = self.inner.lock();
        let from = machine.applied_position().unwrap_or(0);
        for (i, cmd) in inner.commands.iter().enumerate() {
            let position = i as CommitPosition + 1;
            if position > from {
                if let Err(err) = machine.apply(position, cmd) {
                    debug!(node_id = %node_id, position, error = %err, "replayed command rejected");
                }
            }
        }
        inner.replicas.push(Replica { node_id: node_id.clone(), machine });
        info!(node_id = %node_id, replicas = inner.replicas.len(), "replica joined");
        LocalLog { cluster: Arc::clone(self), node_id }
    }

    /// Publish a new leader (or none) to every node.
    pub fn set_leader(&self, leader: Option<NodeId>) {
        info!(leader = ?leader, "leader changed");
        self.leader.send_replace(leader);
    }

    pub fn leader(&self) -> Option<NodeId> { self.leader.borrow().clone() }

    /// Delay applied to every commit, used to exercise proposer timeouts.
    pub fn set_commit_delay(&self, delay: Option<Duration>) { *self.commit_delay.lock() = delay; }

    /// Delay between commit and answering the proposer. A proposer that gives
    /// up inside this window sees a timeout for a command that did commit.
    pub fn set_ack_delay(&self, delay: Option<Duration>) { *self.ack_delay.lock() = delay; }

    /// Take the log offline; proposals fail with `Unavailable` until brought back.
    pub fn set_online(&self, online: bool) { self.inner.lock().online = online; }

    /// Raw committed commands in log order.
    pub fn commands(&self) -> Vec<Vec<u8>> { self.inner.lock().commands.clone() }

    fn commit(&self, proposer: &str, payload: Vec<u8>) -> Result<AppliedCommand, LogError> {
        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(LogError::Unavailable("log offline".into()));
        }
        inner.commands.push(payload);
        let position = inner.commands.len() as CommitPosition;
        let payload = &inner.commands[inner.commands.len() - 1];
        let mut outcome = None;
        for replica in &inner.replicas {
            let result = replica.machine.apply(position, payload);
            if replica.node_id == proposer {
                outcome = Some(result);
            }
        }
        debug!(position, proposer, "committed command");
        match outcome {
            Some(outcome) => Ok(AppliedCommand { position, outcome }),
            None => Err(LogError::Unavailable(format!("proposer {proposer} is not a replica"))),
        }
    }
}

/// Per-node handle onto a `LocalCluster`.
#[derive(Clone)]
pub struct LocalLog {
    cluster: Arc<LocalCluster>,
    node_id: NodeId,
}

impl LocalLog {
    pub fn cluster(&self) -> &Arc<LocalCluster> { &self.cluster }
}

#[async_trait]
impl ReplicatedLog for LocalLog {
    fn node_id(&self) -> &str { &self.node_id }

    async fn propose(&self, payload: Vec<u8>) -> Result<AppliedCommand, LogError> {
        if !self.is_leader() {
            return Err(LogError::NotLeader { leader: self.current_leader() });
        }
        let delay = *self.cluster.commit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let applied = self.cluster.commit(&self.node_id, payload)?;
        let delay = *self.cluster.ack_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(applied)
    }

    fn is_leader(&self) -> bool { self.cluster.leader().as_deref() == Some(self.node_id.as_str()) }

    fn current_leader(&self) -> Option<NodeId> { self.cluster.leader() }

    fn leader_updates(&self) -> watch::Receiver<Option<NodeId>> { self.cluster.leader.subscribe() }
}
