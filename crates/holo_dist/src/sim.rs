//! In-process simulated cluster.
//!
//! A `SimCluster` plays every collaborator of the distributed sender at
//! once: it is the transport (each node is reachable at `sim-node-{id}`),
//! the gossip source, and the set of replicas that evaluate batches. All
//! replicas share one ordered map, so there is no replication to speak of;
//! what is simulated faithfully is routing: range descriptors, leases, meta
//! records, node failures and slow nodes.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use holo_batch::api::{
    DeleteRangeResponse, EndTransactionResponse, GetResponse, IncrementResponse,
    RangeLookupResponse, ReverseScanResponse,
};
use holo_batch::{
    BatchRequest, BatchResponse, Key, KeyValue, KvError, Method, NodeDescriptor, NodeId, RKey,
    RangeDescriptor, RangeId, ReadConsistency, ReplicaDescriptor, Request, Response,
    ScanResponse, TransactionStatus,
};
use tokio::sync::watch;

use crate::gossip::ClusterInfo;
use crate::keys::{self, META1_PREFIX, META2_PREFIX, META_MAX};
use crate::transport::{Connection, ConnectionState, LocalServer, Transport};

/// Address under which node `node_id` is reachable.
pub fn node_address(node_id: NodeId) -> String {
    format!("sim-node-{node_id}")
}

struct SimNode {
    desc: NodeDescriptor,
    up: watch::Sender<bool>,
    hang: AtomicBool,
    calls: AtomicU64,
    local_calls: AtomicU64,
}

struct ClusterState {
    ranges: BTreeMap<RangeId, RangeDescriptor>,
    leaseholders: HashMap<RangeId, NodeId>,
    data: BTreeMap<Key, Vec<u8>>,
    /// Meta records as last committed, when descriptor changes have not been
    /// published yet. Lookups that consider intents see the live view.
    committed_meta: Option<BTreeMap<RKey, RangeDescriptor>>,
    next_range_id: RangeId,
    first_range_gossiped: bool,
    own_node: Option<NodeId>,
}

impl ClusterState {
    fn live_meta(&self) -> BTreeMap<RKey, RangeDescriptor> {
        let mut records = BTreeMap::new();
        for desc in self.ranges.values() {
            for key in keys::range_addressing_keys(desc) {
                records.insert(key, desc.clone());
            }
        }
        records
    }

    fn range_containing(&self, key: &RKey) -> Option<&RangeDescriptor> {
        self.ranges.values().find(|d| d.contains_key(key))
    }

    fn split(&mut self, split_key: &RKey) -> anyhow::Result<(RangeDescriptor, RangeDescriptor)> {
        let left = self
            .range_containing(split_key)
            .cloned()
            .with_context(|| format!("no range contains split key {split_key}"))?;
        if left.start_key == *split_key {
            bail!("{split_key} is already a range boundary");
        }
        let right_id = self.next_range_id;
        self.next_range_id += 1;

        let right = RangeDescriptor {
            range_id: right_id,
            start_key: split_key.clone(),
            end_key: left.end_key.clone(),
            replicas: left.replicas.clone(),
        };
        let left = RangeDescriptor {
            end_key: split_key.clone(),
            ..left
        };
        if let Some(&leaseholder) = self.leaseholders.get(&left.range_id) {
            self.leaseholders.insert(right_id, leaseholder);
        }
        self.ranges.insert(left.range_id, left.clone());
        self.ranges.insert(right_id, right.clone());
        tracing::debug!(left = %left, right = %right, "sim: split range");
        Ok((left, right))
    }
}

struct SimInner {
    nodes: BTreeMap<NodeId, SimNode>,
    state: Mutex<ClusterState>,
}

/// Handle to a simulated cluster. Cheap to clone.
#[derive(Clone)]
pub struct SimCluster {
    inner: Arc<SimInner>,
}

impl SimCluster {
    /// `nodes` nodes and a single range spanning the keyspace, replicated on
    /// the first `replication` nodes with the lease on node 1.
    pub fn new(nodes: usize, replication: usize) -> Self {
        let node_ids: Vec<NodeId> = (1..=nodes as NodeId).collect();
        let replicas: Vec<ReplicaDescriptor> = node_ids
            .iter()
            .take(replication.max(1))
            .map(|&id| ReplicaDescriptor {
                node_id: id,
                store_id: id,
                replica_id: id,
            })
            .collect();

        let mut sim_nodes = BTreeMap::new();
        for &node_id in &node_ids {
            let (up, _) = watch::channel(true);
            sim_nodes.insert(
                node_id,
                SimNode {
                    desc: NodeDescriptor {
                        node_id,
                        address: node_address(node_id),
                        attrs: vec![format!("zone{}", node_id % 3)],
                    },
                    up,
                    hang: AtomicBool::new(false),
                    calls: AtomicU64::new(0),
                    local_calls: AtomicU64::new(0),
                },
            );
        }

        let first = RangeDescriptor {
            range_id: 1,
            start_key: RKey::min(),
            end_key: RKey::max(),
            replicas,
        };
        let mut ranges = BTreeMap::new();
        ranges.insert(1, first);
        let mut leaseholders = HashMap::new();
        if !node_ids.is_empty() {
            leaseholders.insert(1, 1);
        }

        Self {
            inner: Arc::new(SimInner {
                nodes: sim_nodes,
                state: Mutex::new(ClusterState {
                    ranges,
                    leaseholders,
                    data: BTreeMap::new(),
                    committed_meta: None,
                    next_range_id: 2,
                    first_range_gossiped: true,
                    own_node: None,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn node(&self, node_id: NodeId) -> anyhow::Result<&SimNode> {
        self.inner
            .nodes
            .get(&node_id)
            .ok_or_else(|| anyhow!("unknown node {node_id}"))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner.nodes.keys().copied().collect()
    }

    /// Split the range containing `split_key` at it, publishing the new
    /// descriptors immediately.
    pub fn split_range(
        &self,
        split_key: impl Into<RKey>,
    ) -> anyhow::Result<(RangeDescriptor, RangeDescriptor)> {
        self.state().split(&split_key.into())
    }

    /// Split without publishing the new descriptors: replicas enforce the new
    /// bounds, while plain lookups keep returning the old descriptor until
    /// `resolve_meta_intents`.
    pub fn split_range_with_pending_meta(
        &self,
        split_key: impl Into<RKey>,
    ) -> anyhow::Result<(RangeDescriptor, RangeDescriptor)> {
        let mut state = self.state();
        if state.committed_meta.is_none() {
            state.committed_meta = Some(state.live_meta());
        }
        state.split(&split_key.into())
    }

    /// Publish descriptor changes made by `split_range_with_pending_meta`.
    pub fn resolve_meta_intents(&self) {
        self.state().committed_meta = None;
    }

    /// Move the lease of `range_id` to `node_id`.
    pub fn transfer_lease(&self, range_id: RangeId, node_id: NodeId) -> anyhow::Result<()> {
        self.node(node_id)?;
        let mut state = self.state();
        if !state.ranges.contains_key(&range_id) {
            bail!("unknown range r{range_id}");
        }
        state.leaseholders.insert(range_id, node_id);
        tracing::debug!(range_id, node_id, "sim: transferred lease");
        Ok(())
    }

    /// Replace the replica set of `range_id`.
    pub fn change_replicas(&self, range_id: RangeId, nodes: &[NodeId]) -> anyhow::Result<()> {
        for &node_id in nodes {
            self.node(node_id)?;
        }
        let mut state = self.state();
        let desc = state
            .ranges
            .get_mut(&range_id)
            .ok_or_else(|| anyhow!("unknown range r{range_id}"))?;
        desc.replicas = nodes
            .iter()
            .map(|&id| ReplicaDescriptor {
                node_id: id,
                store_id: id,
                replica_id: id,
            })
            .collect();
        Ok(())
    }

    /// Take a node down (`false`) or bring it back. Connections to a down
    /// node report a transient failure and RPCs in flight fail.
    pub fn set_node_up(&self, node_id: NodeId, up: bool) -> anyhow::Result<()> {
        self.node(node_id)?.up.send_replace(up);
        Ok(())
    }

    /// Make every RPC to `node_id` hang forever.
    pub fn set_node_hang(&self, node_id: NodeId, hang: bool) -> anyhow::Result<()> {
        self.node(node_id)?.hang.store(hang, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_first_range_gossiped(&self, gossiped: bool) {
        self.state().first_range_gossiped = gossiped;
    }

    /// Node that `own_node_id` reports.
    pub fn set_own_node(&self, node_id: Option<NodeId>) {
        self.state().own_node = node_id;
    }

    /// Authoritative descriptors, in range id order.
    pub fn descriptors(&self) -> Vec<RangeDescriptor> {
        self.state().ranges.values().cloned().collect()
    }

    /// Authoritative descriptor of the range containing `key`.
    pub fn range_for(&self, key: impl Into<RKey>) -> Option<RangeDescriptor> {
        self.state().range_containing(&key.into()).cloned()
    }

    pub fn leaseholder(&self, range_id: RangeId) -> Option<NodeId> {
        self.state().leaseholders.get(&range_id).copied()
    }

    /// Batches received by `node_id` over the transport.
    pub fn calls(&self, node_id: NodeId) -> u64 {
        self.node(node_id)
            .map(|n| n.calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Batches received by `node_id` through its local server.
    pub fn local_calls(&self, node_id: NodeId) -> u64 {
        self.node(node_id)
            .map(|n| n.local_calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        for node in self.inner.nodes.values() {
            node.calls.store(0, Ordering::SeqCst);
            node.local_calls.store(0, Ordering::SeqCst);
        }
    }

    /// In-process server of `node_id`, for registering as the local server.
    pub fn local_server(&self, node_id: NodeId) -> anyhow::Result<Arc<dyn LocalServer>> {
        self.node(node_id)?;
        Ok(Arc::new(SimLocalServer {
            cluster: self.clone(),
            node_id,
        }))
    }

    /// Evaluate `ba` as the replica on `node_id` would.
    pub fn evaluate(&self, node_id: NodeId, ba: &BatchRequest) -> BatchResponse {
        let mut resp = BatchResponse::new();
        resp.header.timestamp = ba.header.timestamp;
        resp.header.txn = ba.header.txn.clone();
        let mut state = self.state();
        match evaluate_batch(&mut state, node_id, ba, &mut resp) {
            Ok(responses) => resp.responses = responses,
            Err(err) => {
                tracing::trace!(node_id, error = %err, "sim: batch rejected");
                resp.header.error = Some(err);
            }
        }
        resp
    }
}

fn evaluate_batch(
    state: &mut ClusterState,
    node_id: NodeId,
    ba: &BatchRequest,
    resp: &mut BatchResponse,
) -> Result<Vec<Response>, KvError> {
    let range_id = ba.header.range_id;
    let desc = state
        .ranges
        .get(&range_id)
        .cloned()
        .ok_or(KvError::RangeNotFound { range_id })?;
    let Some(replica) = desc.replicas.iter().find(|r| r.node_id == node_id).copied() else {
        return Err(KvError::RangeNotFound { range_id });
    };

    for req in &ba.requests {
        if matches!(req, Request::Noop) {
            continue;
        }
        let span = req.header();
        let start = keys::addr(&span.key)?;
        let end = if span.end_key.is_empty() {
            RKey::min()
        } else {
            keys::addr(&span.end_key)?
        };
        if !desc.contains_key_range(&start, &end) {
            return Err(KvError::RangeKeyMismatch {
                request_start: span.key.clone(),
                request_end: span.end_key.clone(),
                range: Some(desc),
            });
        }
    }

    let consistent = ba.header.read_consistency == ReadConsistency::Consistent;
    if consistent {
        let leaseholder = state.leaseholders.get(&range_id).copied();
        if leaseholder != Some(node_id) {
            let leader = leaseholder.map(|id| ReplicaDescriptor {
                node_id: id,
                store_id: id,
                replica_id: id,
            });
            return Err(KvError::NotLeader {
                range_id,
                replica: Some(replica),
                leader,
            });
        }
    }

    let mut remaining = (ba.header.max_scan_results > 0).then_some(ba.header.max_scan_results);
    // The whole transaction arrived in one batch on one range.
    let one_phase = ba
        .requests
        .iter()
        .any(|r| r.method() == Method::BeginTransaction);
    let mut responses = Vec::with_capacity(ba.requests.len());
    for req in &ba.requests {
        let response = match req {
            Request::Noop => Response::Noop,
            Request::Get(r) => Response::Get(GetResponse {
                value: state.data.get(&r.span.key).cloned(),
            }),
            Request::Put(r) => {
                state.data.insert(r.span.key.clone(), r.value.clone());
                Response::Put
            }
            Request::ConditionalPut(r) => {
                let actual = state.data.get(&r.span.key).cloned();
                if actual != r.exp_value {
                    return Err(KvError::ConditionFailed { actual });
                }
                state.data.insert(r.span.key.clone(), r.value.clone());
                Response::ConditionalPut
            }
            Request::Increment(r) => {
                let current = match state.data.get(&r.span.key) {
                    Some(raw) => decode_counter(raw).ok_or_else(|| {
                        KvError::InvalidBatch(format!(
                            "value at {} is not an integer",
                            r.span.key
                        ))
                    })?,
                    None => 0,
                };
                let new_value = current.wrapping_add(r.increment);
                state
                    .data
                    .insert(r.span.key.clone(), new_value.to_string().into_bytes());
                Response::Increment(IncrementResponse { new_value })
            }
            Request::Delete(r) => {
                state.data.remove(&r.span.key);
                Response::Delete
            }
            Request::DeleteRange(r) => {
                let doomed: Vec<Key> = state
                    .data
                    .range(r.span.key.clone()..r.span.end_key.clone())
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in &doomed {
                    state.data.remove(key);
                }
                Response::DeleteRange(DeleteRangeResponse {
                    keys_deleted: doomed.len() as i64,
                })
            }
            Request::Scan(r) => match scan_limit(r.max_results, remaining) {
                None => Response::Noop,
                Some(limit) => {
                    let rows: Vec<KeyValue> = state
                        .data
                        .range(r.span.key.clone()..r.span.end_key.clone())
                        .take(limit)
                        .map(|(k, v)| KeyValue {
                            key: k.clone(),
                            value: v.clone(),
                        })
                        .collect();
                    consume(&mut remaining, rows.len());
                    Response::Scan(ScanResponse { rows })
                }
            },
            Request::ReverseScan(r) => match scan_limit(r.max_results, remaining) {
                None => Response::Noop,
                Some(limit) => {
                    let rows: Vec<KeyValue> = state
                        .data
                        .range(r.span.key.clone()..r.span.end_key.clone())
                        .rev()
                        .take(limit)
                        .map(|(k, v)| KeyValue {
                            key: k.clone(),
                            value: v.clone(),
                        })
                        .collect();
                    consume(&mut remaining, rows.len());
                    Response::ReverseScan(ReverseScanResponse { rows })
                }
            },
            Request::BeginTransaction(_) => {
                if let Some(txn) = resp.header.txn.as_mut() {
                    txn.writing = true;
                }
                Response::BeginTransaction
            }
            Request::EndTransaction(r) => {
                if let Some(txn) = resp.header.txn.as_mut() {
                    txn.status = if r.commit {
                        TransactionStatus::Committed
                    } else {
                        TransactionStatus::Aborted
                    };
                }
                Response::EndTransaction(EndTransactionResponse {
                    one_phase_commit: one_phase && r.commit,
                })
            }
            Request::RangeLookup(r) => {
                let meta_key = keys::addr(&r.span.key)?;
                let records = if r.consider_intents {
                    state.live_meta()
                } else {
                    state
                        .committed_meta
                        .clone()
                        .unwrap_or_else(|| state.live_meta())
                };
                Response::RangeLookup(RangeLookupResponse {
                    ranges: lookup_records(&records, &meta_key, r.max_ranges, r.reverse),
                })
            }
            Request::AdminSplit(r) => {
                let split_key = keys::addr(&r.split_key)?;
                state
                    .split(&split_key)
                    .map_err(|err| KvError::InvalidBatch(format!("{err:#}")))?;
                Response::AdminSplit
            }
        };
        responses.push(response);
    }
    Ok(responses)
}

/// Effective row limit of a scan, or `None` when the batch budget is spent.
fn scan_limit(max_results: i64, remaining: Option<i64>) -> Option<usize> {
    let own = (max_results > 0).then_some(max_results);
    let limit = match (own, remaining) {
        (_, Some(0)) => return None,
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return Some(usize::MAX),
    };
    Some(usize::try_from(limit).unwrap_or(0))
}

fn consume(remaining: &mut Option<i64>, rows: usize) {
    if let Some(left) = remaining.as_mut() {
        *left -= rows as i64;
    }
}

fn decode_counter(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// Serve a range lookup from the meta records of one level.
fn lookup_records(
    records: &BTreeMap<RKey, RangeDescriptor>,
    meta_key: &RKey,
    max_ranges: usize,
    reverse: bool,
) -> Vec<RangeDescriptor> {
    let (level_start, level_end) = if meta_key.has_prefix(META1_PREFIX) {
        (RKey(META1_PREFIX.to_vec()), RKey(META2_PREFIX.to_vec()))
    } else {
        (RKey(META2_PREFIX.to_vec()), RKey(META_MAX.to_vec()))
    };
    let max_ranges = max_ranges.max(1);
    if reverse {
        let Some((target_key, target)) = records
            .range::<RKey, _>((Bound::Included(meta_key), Bound::Excluded(&level_end)))
            .next()
        else {
            return Vec::new();
        };
        let mut out = vec![target.clone()];
        out.extend(
            records
                .range::<RKey, _>((Bound::Included(&level_start), Bound::Excluded(target_key)))
                .rev()
                .take(max_ranges - 1)
                .map(|(_, d)| d.clone()),
        );
        out
    } else {
        records
            .range::<RKey, _>((Bound::Excluded(meta_key), Bound::Excluded(&level_end)))
            .take(max_ranges)
            .map(|(_, d)| d.clone())
            .collect()
    }
}

impl Transport for SimCluster {
    fn dial(&self, addr: &str) -> anyhow::Result<Arc<dyn Connection>> {
        let node_id = self
            .inner
            .nodes
            .values()
            .find(|n| n.desc.address == addr)
            .map(|n| n.desc.node_id)
            .ok_or_else(|| anyhow!("no simulated node listens on {addr}"))?;
        Ok(Arc::new(SimConnection {
            cluster: self.clone(),
            node_id,
        }))
    }
}

impl ClusterInfo for SimCluster {
    fn first_range_descriptor(&self) -> anyhow::Result<RangeDescriptor> {
        let state = self.state();
        if !state.first_range_gossiped {
            bail!("first range descriptor not gossiped yet");
        }
        state
            .range_containing(&RKey::min())
            .cloned()
            .context("cluster has no first range")
    }

    fn node_descriptor(&self, node_id: NodeId) -> anyhow::Result<NodeDescriptor> {
        Ok(self.node(node_id)?.desc.clone())
    }

    fn own_node_id(&self) -> Option<NodeId> {
        self.state().own_node
    }
}

struct SimConnection {
    cluster: SimCluster,
    node_id: NodeId,
}

impl SimConnection {
    fn node(&self) -> anyhow::Result<&SimNode> {
        self.cluster.node(self.node_id)
    }
}

#[async_trait]
impl Connection for SimConnection {
    fn state(&self) -> ConnectionState {
        match self.node() {
            Ok(node) if *node.up.borrow() => ConnectionState::Ready,
            Ok(_) => ConnectionState::TransientFailure,
            Err(_) => ConnectionState::Shutdown,
        }
    }

    async fn wait_for_state_change(
        &self,
        current: ConnectionState,
    ) -> anyhow::Result<ConnectionState> {
        let mut rx = self.node()?.up.subscribe();
        loop {
            let state = self.state();
            if state != current {
                return Ok(state);
            }
            rx.changed()
                .await
                .context("simulated node went away")?;
        }
    }

    async fn batch(&self, ba: BatchRequest) -> anyhow::Result<BatchResponse> {
        let node = self.node()?;
        if node.hang.load(Ordering::SeqCst) {
            futures_util::future::pending::<()>().await;
        }
        if !*node.up.borrow() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("{} is down", node.desc.address),
            )
            .into());
        }
        node.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(self.cluster.evaluate(self.node_id, &ba))
    }
}

struct SimLocalServer {
    cluster: SimCluster,
    node_id: NodeId,
}

#[async_trait]
impl LocalServer for SimLocalServer {
    async fn batch(&self, ba: BatchRequest) -> anyhow::Result<BatchResponse> {
        let node = self.cluster.node(self.node_id)?;
        node.local_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.cluster.evaluate(self.node_id, &ba))
    }
}
