//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use holo_batch::{
    BatchRequest, BatchResponse, Key, KvError, ReadConsistency, Request, Response, Timestamp,
    Transaction,
};
use holo_dist::{DistSender, DistSenderConfig, RetryOptions, RpcContext, SimCluster};

/// Send-next delay used by tests that do not exercise it.
pub const SEND_NEXT_TIMEOUT: Duration = Duration::from_millis(200);

/// A simulated cluster plus a sender routed through it.
pub struct Harness {
    pub cluster: SimCluster,
    pub rpc: Arc<RpcContext>,
    pub sender: DistSender,
}

/// Retry policy with short backoffs so failing tests fail fast.
pub fn fast_retry(max_retries: usize) -> RetryOptions {
    RetryOptions {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        max_retries,
        ..RetryOptions::default()
    }
}

/// Config used by most tests: short timeouts, fast retries.
pub fn test_config() -> DistSenderConfig {
    DistSenderConfig {
        send_next_timeout: SEND_NEXT_TIMEOUT,
        rpc_timeout: Duration::from_secs(5),
        retry: fast_retry(20),
        ..DistSenderConfig::default()
    }
}

/// Build a sender over an existing cluster.
pub fn sender_for(cluster: &SimCluster, config: DistSenderConfig) -> (Arc<RpcContext>, DistSender) {
    let rpc = Arc::new(RpcContext::new(Arc::new(cluster.clone())));
    let sender = DistSender::new(config, Arc::new(cluster.clone()), rpc.clone());
    (rpc, sender)
}

/// Cluster of `nodes` nodes, every range replicated on all of them. The
/// sender runs on node 1, so node 1 is always tried first.
pub fn harness(nodes: usize) -> Harness {
    harness_with_config(nodes, test_config())
}

pub fn harness_with_config(nodes: usize, config: DistSenderConfig) -> Harness {
    let cluster = SimCluster::new(nodes, nodes);
    cluster.set_own_node(Some(1));
    let (rpc, sender) = sender_for(&cluster, config);
    Harness {
        cluster,
        rpc,
        sender,
    }
}

/// Send a batch made of `requests` with a default header.
pub async fn send(sender: &DistSender, requests: Vec<Request>) -> Result<BatchResponse, KvError> {
    sender.send(BatchRequest::with_requests(requests)).await
}

/// Batch carrying a fresh pending transaction anchored at its first key.
pub fn txn_batch(requests: Vec<Request>) -> BatchRequest {
    let anchor = requests
        .first()
        .map(|r| r.header().key.clone())
        .unwrap_or_default();
    let mut ba = BatchRequest::with_requests(requests);
    ba.header.txn = Some(Transaction::new(
        7,
        "test-txn",
        anchor,
        Timestamp::new(1_000, 0),
    ));
    ba
}

/// Batch served by any replica without a lease check.
pub fn inconsistent_batch(requests: Vec<Request>) -> BatchRequest {
    let mut ba = BatchRequest::with_requests(requests);
    ba.header.read_consistency = ReadConsistency::Inconsistent;
    ba
}

/// Value stored at `key`, read through the sender.
pub async fn get(sender: &DistSender, key: &str) -> Option<Vec<u8>> {
    let resp = match send(sender, vec![Request::get(key)]).await {
        Ok(resp) => resp,
        Err(err) => panic!("get {key} failed: {err}"),
    };
    match resp.responses.into_iter().next() {
        Some(Response::Get(get)) => get.value,
        other => panic!("unexpected response to get: {other:?}"),
    }
}

/// Write `key = key` for every key, one batch per key.
pub async fn put_keys(sender: &DistSender, keys: &[&str]) {
    for key in keys {
        if let Err(err) = send(sender, vec![Request::put(*key, *key)]).await {
            panic!("put {key} failed: {err}");
        }
    }
}

/// Keys of the rows in a scan or reverse scan response.
pub fn row_keys(resp: &Response) -> Vec<Key> {
    resp.rows().iter().map(|kv| kv.key.clone()).collect()
}

pub fn keys_of(keys: &[&str]) -> Vec<Key> {
    keys.iter().map(|k| Key::from(*k)).collect()
}
