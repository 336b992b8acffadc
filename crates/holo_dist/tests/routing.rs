//! Routing of batches across range boundaries.
//!
//! Test flow:
//! 1) Start a simulated three-node cluster and split its keyspace.
//! 2) Send batches that touch one or several ranges through `DistSender`.
//! 3) Change the range layout underneath a warm descriptor cache.
//!
//! Failure model covered:
//! - Stale cached descriptors after splits.
//! - Multi-range writes outside a transaction.
//! - A trailing `EndTransaction` that cannot travel with its batch.
//!
//! Verification:
//! - Replies are stitched back in request order, rows in key order.
//! - Usage errors surface before any data RPC is sent.
//! - A transaction confined to one range commits in a single round trip.

mod common;

use holo_batch::api::EndTransactionResponse;
use holo_batch::{KvError, RKey, Request, Response, TransactionStatus};

use common::{get, harness, inconsistent_batch, keys_of, put_keys, row_keys, send, txn_batch};

#[tokio::test]
async fn scan_across_ranges_returns_rows_in_key_order() {
    let h = harness(3);
    h.cluster.split_range("g").expect("split at g");
    h.cluster.split_range("m").expect("split at m");
    put_keys(&h.sender, &["a", "c", "h", "k", "n", "x"]).await;

    let before = h.sender.stats().snapshot();
    let resp = h
        .sender
        .send(txn_batch(vec![Request::scan("a", "z", 0)]))
        .await
        .expect("scan");
    let after = h.sender.stats().snapshot();

    assert_eq!(
        row_keys(&resp.responses[0]),
        keys_of(&["a", "c", "h", "k", "n", "x"])
    );
    assert_eq!(after.range_dispatches - before.range_dispatches, 3);
}

#[tokio::test]
async fn reverse_scan_walks_ranges_backwards() {
    let h = harness(3);
    h.cluster.split_range("g").expect("split at g");
    h.cluster.split_range("m").expect("split at m");
    put_keys(&h.sender, &["a", "c", "h", "k", "n", "x"]).await;

    let resp = h
        .sender
        .send(inconsistent_batch(vec![Request::reverse_scan("a", "z", 0)]))
        .await
        .expect("reverse scan");
    assert_eq!(
        row_keys(&resp.responses[0]),
        keys_of(&["x", "n", "k", "h", "c", "a"])
    );
    assert!(matches!(resp.responses[0], Response::ReverseScan(_)));
}

#[tokio::test]
async fn stale_descriptor_after_split_is_evicted_and_refreshed() {
    let h = harness(3);
    put_keys(&h.sender, &["a", "h", "x"]).await;
    let cached = h.sender.range_cache().get_cached(&RKey::from("h"), false);
    assert_eq!(cached.map(|d| d.range_id), Some(1));

    h.cluster.split_range("g").expect("split at g");
    h.cluster.split_range("m").expect("split at m");

    let before = h.sender.stats().snapshot();
    let resp = h
        .sender
        .send(txn_batch(vec![Request::scan("a", "z", 0)]))
        .await
        .expect("scan after split");
    let after = h.sender.stats().snapshot();

    assert_eq!(row_keys(&resp.responses[0]), keys_of(&["a", "h", "x"]));
    assert!(after.descriptor_evictions > before.descriptor_evictions);
    assert!(after.range_lookups > before.range_lookups);

    let cached = h.sender.range_cache().get_cached(&RKey::from("h"), false);
    let actual = h.cluster.range_for("h");
    assert_eq!(cached.map(|d| (*d).clone()), actual);
}

#[tokio::test]
async fn split_issued_through_the_sender_is_picked_up() {
    let h = harness(3);
    put_keys(&h.sender, &["a", "x"]).await;

    let resp = send(&h.sender, vec![Request::admin_split("a", "m")])
        .await
        .expect("admin split");
    assert_eq!(resp.responses, vec![Response::AdminSplit]);
    assert_eq!(h.cluster.descriptors().len(), 2);

    assert_eq!(get(&h.sender, "x").await, Some(b"x".to_vec()));
    let cached = h.sender.range_cache().get_cached(&RKey::from("x"), false);
    assert_eq!(cached.map(|d| d.start_key.clone()), Some(RKey::from("m")));
}

#[tokio::test]
async fn multi_range_batch_without_txn_is_rejected_before_any_dispatch() {
    let h = harness(3);
    h.cluster.split_range("m").expect("split at m");

    let before = h.sender.stats().snapshot();
    let err = send(&h.sender, vec![Request::put("a", "1"), Request::put("x", "2")])
        .await
        .expect_err("multi-range write outside a txn");
    assert_eq!(err, KvError::OpRequiresTxn);

    let err = send(&h.sender, vec![Request::scan("a", "z", 0)])
        .await
        .expect_err("consistent multi-range scan outside a txn");
    assert_eq!(err, KvError::OpRequiresTxn);
    let after = h.sender.stats().snapshot();
    assert_eq!(after.range_dispatches, before.range_dispatches);
    assert_eq!(get(&h.sender, "a").await, None);

    h.sender
        .send(txn_batch(vec![Request::put("a", "1"), Request::put("x", "2")]))
        .await
        .expect("multi-range write inside a txn");
    assert_eq!(get(&h.sender, "a").await, Some(b"1".to_vec()));
    assert_eq!(get(&h.sender, "x").await, Some(b"2".to_vec()));

    h.sender
        .send(inconsistent_batch(vec![Request::scan("a", "z", 0)]))
        .await
        .expect("inconsistent multi-range scan");
}

#[tokio::test]
async fn end_transaction_spanning_ranges_is_sent_on_its_own() {
    let h = harness(3);
    h.cluster.split_range("m").expect("split at m");

    let resp = h
        .sender
        .send(txn_batch(vec![
            Request::put("a", "1"),
            Request::put("x", "2"),
            Request::end_transaction("a", true),
        ]))
        .await
        .expect("commit");

    assert_eq!(resp.responses.len(), 3);
    assert_eq!(resp.responses[0], Response::Put);
    assert_eq!(resp.responses[1], Response::Put);
    assert_eq!(
        resp.responses[2],
        Response::EndTransaction(EndTransactionResponse {
            one_phase_commit: false
        })
    );
    assert_eq!(
        resp.header.txn.map(|t| t.status),
        Some(TransactionStatus::Committed)
    );
    assert_eq!(get(&h.sender, "x").await, Some(b"2".to_vec()));
}

#[tokio::test]
async fn single_range_transaction_commits_in_one_phase() {
    let h = harness(3);
    h.cluster.split_range("m").expect("split at m");

    let before = h.sender.stats().snapshot();
    let resp = h
        .sender
        .send(txn_batch(vec![
            Request::begin_transaction("a"),
            Request::put("a", "1"),
            Request::put("b", "2"),
            Request::end_transaction("a", true),
        ]))
        .await
        .expect("commit");
    let after = h.sender.stats().snapshot();

    assert_eq!(
        resp.responses[3],
        Response::EndTransaction(EndTransactionResponse {
            one_phase_commit: true
        })
    );
    assert_eq!(after.range_dispatches - before.range_dispatches, 1);
    assert_eq!(get(&h.sender, "b").await, Some(b"2".to_vec()));
}

#[tokio::test]
async fn single_range_writes_round_trip() {
    let h = harness(3);
    h.cluster.split_range("m").expect("split at m");

    for expected in [5, 10] {
        let resp = send(&h.sender, vec![Request::increment("counter", 5)])
            .await
            .expect("increment");
        match &resp.responses[0] {
            Response::Increment(inc) => assert_eq!(inc.new_value, expected),
            other => panic!("unexpected response {other:?}"),
        }
    }

    put_keys(&h.sender, &["p"]).await;
    let err = send(
        &h.sender,
        vec![Request::conditional_put("p", "new", Some(b"old".to_vec()))],
    )
    .await
    .expect_err("condition does not hold");
    assert_eq!(
        err,
        KvError::ConditionFailed {
            actual: Some(b"p".to_vec())
        }
    );

    let resp = send(&h.sender, vec![Request::delete_range("n", "z")])
        .await
        .expect("delete range within one range");
    match &resp.responses[0] {
        Response::DeleteRange(del) => assert_eq!(del.keys_deleted, 1),
        other => panic!("unexpected response {other:?}"),
    }
}
