//! Result limits on scans that cross ranges.
//!
//! Test flow:
//! 1) Split a simulated cluster into `[min, g)`, `[g, m)` and `[m, max)`.
//! 2) Write two rows into each range.
//! 3) Scan with a batch-wide limit or with per-request limits.
//!
//! Verification:
//! - Exactly `limit` rows come back, in order, and no range past the limit
//!   is contacted.
//! - Requests the limit cut off still get a typed, empty response.

mod common;

use holo_batch::{BatchRequest, KvError, Request, Response, ScanResponse};

use common::{harness, keys_of, put_keys, row_keys, txn_batch, Harness};

async fn populated() -> Harness {
    let h = harness(3);
    h.cluster.split_range("g").expect("split at g");
    h.cluster.split_range("m").expect("split at m");
    put_keys(&h.sender, &["a", "b", "h", "i", "n", "o"]).await;
    h
}

fn limited(requests: Vec<Request>, limit: i64) -> BatchRequest {
    let mut ba = txn_batch(requests);
    ba.header.max_scan_results = limit;
    ba
}

#[tokio::test]
async fn batch_limit_stops_after_enough_rows() {
    let h = populated().await;

    let before = h.sender.stats().snapshot();
    let resp = h
        .sender
        .send(limited(vec![Request::scan("a", "z", 0)], 3))
        .await
        .expect("limited scan");
    let after = h.sender.stats().snapshot();

    assert_eq!(row_keys(&resp.responses[0]), keys_of(&["a", "b", "h"]));
    assert_eq!(after.range_dispatches - before.range_dispatches, 2);
}

#[tokio::test]
async fn batch_limit_applies_to_reverse_scans() {
    let h = populated().await;

    let resp = h
        .sender
        .send(limited(vec![Request::reverse_scan("a", "z", 0)], 3))
        .await
        .expect("limited reverse scan");
    assert_eq!(row_keys(&resp.responses[0]), keys_of(&["o", "n", "i"]));
}

#[tokio::test]
async fn requests_past_the_limit_get_empty_responses() {
    let h = populated().await;

    let resp = h
        .sender
        .send(limited(
            vec![Request::scan("a", "g", 0), Request::scan("n", "z", 0)],
            2,
        ))
        .await
        .expect("limited scans");

    assert_eq!(row_keys(&resp.responses[0]), keys_of(&["a", "b"]));
    assert_eq!(resp.responses[1], Response::Scan(ScanResponse::default()));
}

#[tokio::test]
async fn per_request_limits_are_tracked_across_ranges() {
    let h = populated().await;

    let before = h.sender.stats().snapshot();
    let resp = h
        .sender
        .send(txn_batch(vec![
            Request::scan("a", "z", 3),
            Request::scan("a", "z", 5),
        ]))
        .await
        .expect("bounded scans");
    let after = h.sender.stats().snapshot();

    assert_eq!(row_keys(&resp.responses[0]), keys_of(&["a", "b", "h"]));
    assert_eq!(
        row_keys(&resp.responses[1]),
        keys_of(&["a", "b", "h", "i", "n"])
    );
    assert_eq!(after.range_dispatches - before.range_dispatches, 3);
}

#[tokio::test]
async fn limit_with_mixed_requests_is_rejected() {
    let h = populated().await;

    let err = h
        .sender
        .send(limited(
            vec![Request::scan("a", "z", 0), Request::put("c", "v")],
            2,
        ))
        .await
        .expect_err("write under a limit");
    assert!(matches!(err, KvError::InvalidBatch(_)));
}
