use std::sync::Arc;
use std::time::Duration;

use super::{issuer_sk, machine, make_entry, short_config, TestCluster};
use crate::errors::{ApplyError, GatewayError};
use crate::gateway::{GatewayRequest, GatewayResponse};
use crate::traits::IndexService;
use crate::types::GENESIS_HASH;

fn propose(e: &crate::types::KeyIndexEntry) -> GatewayRequest { GatewayRequest::Propose { command: e.to_json().unwrap() } }

#[tokio::test]
async fn leader_serves_propose_and_queries() {
    let cluster = TestCluster::new(1);
    let gw = cluster.gateway(0);
    let e0 = make_entry(&issuer_sk(), "k1", 0, GENESIS_HASH);

    let receipt = match gw.handle(propose(&e0)).await.unwrap() {
        GatewayResponse::Committed(receipt) => receipt,
        other => panic!("expected commit, got {other:?}"),
    };
    assert_eq!((receipt.index, receipt.position), (0, 1));

    assert_eq!(gw.handle(GatewayRequest::GetIndex { key_id: "k1".into() }).await.unwrap(), GatewayResponse::Index(Some(0)));
    assert_eq!(gw.handle(GatewayRequest::GetAllKeys).await.unwrap(), GatewayResponse::Keys(vec!["k1".into()]));
    assert_eq!(gw.handle(GatewayRequest::GetIndex { key_id: "nope".into() }).await.unwrap(), GatewayResponse::Index(None));
}

#[tokio::test]
async fn follower_forwards_and_all_replicas_agree() {
    let cluster = TestCluster::new(3);
    let follower = cluster.gateway(2);
    let sk = issuer_sk();
    let e0 = make_entry(&sk, "k1", 0, GENESIS_HASH);
    let e1 = make_entry(&sk, "k1", 1, &e0.hash);

    let r0 = follower.propose(e0.to_json().unwrap()).await.unwrap();
    let r1 = cluster.gateway(1).propose(e1.to_json().unwrap()).await.unwrap();
    assert_eq!((r0.position, r1.position), (1, 2));

    let head = follower.fetch_head("k1").await.unwrap().unwrap();
    assert_eq!(head.hash, e1.hash);
    for gw in &cluster.gateways {
        assert_eq!(gw.machine().get_head("k1"), Some(head.clone()));
        assert_eq!(gw.machine().snapshot(), cluster.gateway(0).machine().snapshot());
    }
}

#[tokio::test]
async fn rejection_is_relayed_verbatim() {
    let cluster = TestCluster::new(2);
    let sk = issuer_sk();
    let e0 = make_entry(&sk, "k1", 0, GENESIS_HASH);
    cluster.gateway(0).handle(propose(&e0)).await.unwrap();

    let replay = make_entry(&sk, "k1", 0, &e0.hash);
    let err = cluster.gateway(1).handle(propose(&replay)).await.unwrap_err();
    assert_eq!(err, GatewayError::Rejected(ApplyError::IndexNotMonotonic { recorded: 0, got: 0 }));
}

#[tokio::test]
async fn fails_fast_without_leader() {
    let cluster = TestCluster::new(3);
    cluster.log.set_leader(None);
    let e0 = make_entry(&issuer_sk(), "k1", 0, GENESIS_HASH);
    for gw in &cluster.gateways {
        assert_eq!(gw.handle(propose(&e0)).await.unwrap_err(), GatewayError::NoLeader);
        assert_eq!(gw.fetch_head("k1").await.unwrap_err(), GatewayError::NoLeader);
    }
    assert!(cluster.log.commands().is_empty());
}

#[tokio::test]
async fn follows_leader_change_notifications() {
    let cluster = TestCluster::new(3);
    let sk = issuer_sk();
    let e0 = make_entry(&sk, "k1", 0, GENESIS_HASH);
    cluster.gateway(2).handle(propose(&e0)).await.unwrap();

    cluster.log.set_leader(Some("n2".into()));
    assert_eq!(cluster.gateway(2).known_leader().as_deref(), Some("n2"));
    // n1 lost leadership and now forwards too
    let e1 = make_entry(&sk, "k1", 1, &e0.hash);
    let reply = cluster.gateway(0).handle(propose(&e1)).await.unwrap();
    assert!(matches!(reply, GatewayResponse::Committed(r) if r.position == 2));
    assert_eq!(cluster.gateway(2).machine().get_index("k1"), Some(1));
}

#[tokio::test]
async fn unreachable_leader_is_reported_as_unavailable() {
    let cluster = TestCluster::new(2);
    cluster.transport.unregister("n1");
    let err = cluster.gateway(1).handle(GatewayRequest::GetAllKeys).await.unwrap_err();
    assert!(matches!(err, GatewayError::Unavailable(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn concurrent_proposals_for_one_key_accept_exactly_one() {
    let cluster = TestCluster::new(3);
    let e0 = make_entry(&issuer_sk(), "k1", 0, GENESIS_HASH);
    let handles: Vec<_> = cluster
        .gateways
        .iter()
        .map(|gw| {
            let gw = Arc::clone(gw);
            let request = propose(&e0);
            tokio::spawn(async move { gw.handle(request).await })
        })
        .collect();

    let mut committed = Vec::new();
    let mut rejected = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(GatewayResponse::Committed(receipt)) => committed.push(receipt),
            Err(GatewayError::Rejected(reason)) => rejected.push(reason),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].index, 0);
    assert_eq!(rejected.len(), 2);
    assert!(rejected.iter().all(ApplyError::is_lost_race));

    assert_eq!(cluster.log.commands().len(), 3);
    let reference = cluster.gateway(0).machine().snapshot();
    for gw in &cluster.gateways {
        assert_eq!(gw.machine().snapshot(), reference);
        assert_eq!(gw.machine().get_index("k1"), Some(0));
    }
}

#[tokio::test]
async fn dropped_gateway_is_released_by_transport() {
    let cluster = TestCluster::new(2);
    let TestCluster { mut gateways, .. } = cluster;
    let follower = gateways.pop().unwrap();
    let leader = Arc::downgrade(&gateways[0]);
    drop(gateways);
    assert!(leader.upgrade().is_none());

    let err = follower.handle(GatewayRequest::GetAllKeys).await.unwrap_err();
    assert!(matches!(err, GatewayError::Unavailable(_)));
}

#[tokio::test]
async fn late_replica_replays_log_including_rejections() {
    let cluster = TestCluster::new(1);
    let gw = cluster.gateway(0);
    let e0 = make_entry(&issuer_sk(), "k1", 0, GENESIS_HASH);
    gw.handle(propose(&e0)).await.unwrap();
    gw.handle(propose(&e0)).await.unwrap_err();

    let late = machine();
    cluster.log.join("n9", Arc::clone(&late));
    assert_eq!(late.applied_position(), Some(2));
    assert_eq!(late.stats().rejected(), 1);
    assert_eq!(late.snapshot(), gw.machine().snapshot());
}

#[tokio::test(start_paused = true)]
async fn slow_commit_times_out_as_ambiguous() {
    let cluster = TestCluster::with_config(2, short_config());
    cluster.log.set_commit_delay(Some(Duration::from_secs(10)));
    let e0 = make_entry(&issuer_sk(), "k1", 0, GENESIS_HASH);

    let err = cluster.gateway(0).handle(propose(&e0)).await.unwrap_err();
    assert_eq!(err, GatewayError::Timeout { after_ms: 200 });
    assert!(err.is_ambiguous());

    let err = cluster.gateway(1).handle(propose(&e0)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }));
}

#[test]
fn requests_and_replies_have_stable_json_shape() {
    let req: GatewayRequest = serde_json::from_str(r#"{"op":"get_entries","limit":5}"#).unwrap();
    assert_eq!(req, GatewayRequest::GetEntries { limit: 5 });
    let reply: Result<GatewayResponse, GatewayError> = Err(GatewayError::NoLeader);
    let text = serde_json::to_string(&reply).unwrap();
    assert_eq!(text, r#"{"Err":"NoLeader"}"#);
    let ok = serde_json::to_value(GatewayResponse::Index(Some(3))).unwrap();
    assert_eq!(ok, serde_json::json!({"kind": "index", "value": 3}));
}
