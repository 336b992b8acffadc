//! Lease movement and replica membership changes.
//!
//! Test flow:
//! 1) Warm the sender's caches against a simulated cluster.
//! 2) Move the lease, optionally to a node the cached descriptor does not
//!    list.
//! 3) Read through the sender again.
//!
//! Failure model covered:
//! - Replicas answering `NotLeader` with a leader hint.
//! - Leader hints pointing outside the cached replica set.
//!
//! Verification:
//! - The leader cache follows the lease; later reads go to the leader first.
//! - A hint outside the descriptor refreshes the descriptor.

mod common;

use holo_batch::{RKey, Request};
use holo_dist::SimCluster;

use common::{get, harness, inconsistent_batch, put_keys, sender_for, test_config};

#[tokio::test]
async fn not_leader_hint_updates_leader_cache() {
    let h = harness(3);
    put_keys(&h.sender, &["a"]).await;
    assert!(h.sender.leader_cache().lookup(1).is_none());

    h.cluster.transfer_lease(1, 3).expect("lease transfer");
    assert_eq!(get(&h.sender, "a").await, Some(b"a".to_vec()));

    let leader = h.sender.leader_cache().lookup(1).expect("leader learned");
    assert_eq!(leader.node_id, 3);
    assert_eq!(h.sender.stats().snapshot().leader_updates, 1);

    h.cluster.reset_calls();
    assert_eq!(get(&h.sender, "a").await, Some(b"a".to_vec()));
    assert_eq!(h.cluster.calls(1), 0);
    assert_eq!(h.cluster.calls(3), 1);
}

#[tokio::test]
async fn leader_outside_cached_descriptor_refreshes_it() {
    let cluster = SimCluster::new(3, 2);
    cluster.set_own_node(Some(1));
    let (_rpc, sender) = sender_for(&cluster, test_config());
    put_keys(&sender, &["a"]).await;
    let cached = sender.range_cache().get_cached(&RKey::from("a"), false);
    assert_eq!(cached.map(|d| d.replicas.len()), Some(2));

    cluster.change_replicas(1, &[1, 2, 3]).expect("add replica");
    cluster.transfer_lease(1, 3).expect("lease transfer");

    let before = sender.stats().snapshot();
    assert_eq!(get(&sender, "a").await, Some(b"a".to_vec()));
    let after = sender.stats().snapshot();

    assert!(after.descriptor_evictions > before.descriptor_evictions);
    assert!(after.routing_refreshes > before.routing_refreshes);
    let cached = sender.range_cache().get_cached(&RKey::from("a"), false);
    assert_eq!(cached.map(|d| d.replicas.len()), Some(3));
    assert_eq!(sender.leader_cache().lookup(1).map(|r| r.node_id), Some(3));
}

#[tokio::test]
async fn inconsistent_reads_skip_the_leader() {
    let h = harness(3);
    put_keys(&h.sender, &["a"]).await;
    h.cluster.transfer_lease(1, 3).expect("lease transfer");
    h.cluster.reset_calls();

    let resp = h
        .sender
        .send(inconsistent_batch(vec![Request::get("a")]))
        .await
        .expect("inconsistent read");
    assert_eq!(resp.responses.len(), 1);
    assert_eq!(h.cluster.calls(1), 1);
    assert_eq!(h.cluster.calls(3), 0);
    assert!(h.sender.leader_cache().lookup(1).is_none());
}
