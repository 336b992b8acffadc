//! Distributed sender.
//!
//! `DistSender` accepts a batch addressed to arbitrary keys, splits it at
//! range boundaries using the descriptor cache, sends each single-range
//! sub-batch through the replica sender and stitches the replies back
//! together. Stale routing (splits, merges, lease moves) is repaired inside
//! a per-range retry loop by evicting cached descriptors and updating the
//! leader cache.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use holo_batch::{
    BatchRequest, BatchResponse, KvError, Method, NodeDescriptor, RKey, RSpan, RangeDescriptor,
    RangeId, ReadConsistency, ReplicaDescriptor, Request, Response,
};
use rand::Rng;
use tracing::Instrument;

use crate::clock::HybridClock;
use crate::config::DistSenderConfig;
use crate::gossip::ClusterInfo;
use crate::keys;
use crate::leader_cache::LeaderCache;
use crate::range_cache::{RangeDescriptorCache, RangeDescriptorDb};
use crate::replica::ReplicaSlice;
use crate::retry::Retry;
use crate::send::{OrderingPolicy, ReplicaSender, RpcSend, SendOptions};
use crate::stats::SenderStats;
use crate::transport::RpcContext;

/// Anything that executes batches.
#[async_trait]
pub trait Sender: Send + Sync + 'static {
    async fn send(&self, ba: BatchRequest) -> Result<BatchResponse, KvError>;
}

/// How the per-range retry loop reacts to a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Every replica failed but may recover: drop the descriptor, back off.
    EvictAndRetry,
    /// Every replica failed for good: drop the descriptor and give up.
    EvictAndAbort,
    /// The descriptor is stale: drop it and look again immediately.
    EvictAndRefresh,
    /// The lease moved to a replica we know about: retry there immediately.
    UpdateLeaderAndRetry(ReplicaDescriptor),
    /// The lease moved somewhere the descriptor does not list: refresh both
    /// caches and retry immediately.
    EvictAndClearLeader,
    /// Back off and try again with the same routing.
    Retry,
    Abort,
}

/// Map an error from one single-range attempt against `desc` to the retry
/// loop's next step.
pub fn classify_error(err: &KvError, desc: &RangeDescriptor) -> RetryDecision {
    match err {
        KvError::Send { retryable: true, .. } => RetryDecision::EvictAndRetry,
        KvError::Send {
            retryable: false, ..
        } => RetryDecision::EvictAndAbort,
        KvError::RangeNotFound { .. } | KvError::RangeKeyMismatch { .. } => {
            RetryDecision::EvictAndRefresh
        }
        KvError::NotLeader { leader, .. } => match leader {
            Some(leader) if desc.find_replica(leader.store_id).is_some() => {
                RetryDecision::UpdateLeaderAndRetry(*leader)
            }
            _ => RetryDecision::EvictAndClearLeader,
        },
        err if err.is_retryable() => RetryDecision::Retry,
        _ => RetryDecision::Abort,
    }
}

fn internal(message: String) -> KvError {
    tracing::error!("{message}");
    KvError::Internal(message)
}

async fn send_rpc(
    rpc_send: &dyn RpcSend,
    opts: SendOptions,
    range_id: RangeId,
    replicas: ReplicaSlice,
    mut ba: BatchRequest,
) -> Result<BatchResponse, KvError> {
    if replicas.is_empty() {
        return Err(KvError::NoNodeAddrsAvailable { range_id });
    }
    ba.header.range_id = range_id;
    rpc_send.send(opts, replicas, ba).await
}

/// `RangeDescriptorDb` backed by the cluster itself: the first range comes
/// from gossip, everything else from `RangeLookup` requests to meta ranges.
pub struct ClusterRangeDescriptorDb {
    gossip: Arc<dyn ClusterInfo>,
    rpc_send: Arc<dyn RpcSend>,
    max_ranges: usize,
    opts: SendOptions,
}

impl ClusterRangeDescriptorDb {
    pub fn new(
        gossip: Arc<dyn ClusterInfo>,
        rpc_send: Arc<dyn RpcSend>,
        config: &DistSenderConfig,
    ) -> Self {
        Self {
            gossip,
            rpc_send,
            max_ranges: config.range_lookup_max_ranges.max(1),
            opts: SendOptions {
                ordering: OrderingPolicy::Random,
                send_next_timeout: config.send_next_timeout,
                timeout: config.rpc_timeout,
            },
        }
    }
}

#[async_trait]
impl RangeDescriptorDb for ClusterRangeDescriptorDb {
    async fn range_lookup(
        &self,
        meta_key: &RKey,
        desc: &RangeDescriptor,
        consider_intents: bool,
        reverse: bool,
    ) -> Result<Vec<RangeDescriptor>, KvError> {
        let mut ba = BatchRequest::with_requests(vec![Request::range_lookup(
            meta_key.as_raw_key(),
            self.max_ranges,
            consider_intents,
            reverse,
        )]);
        ba.header.read_consistency = ReadConsistency::Inconsistent;
        let replicas = ReplicaSlice::new(self.gossip.as_ref(), desc);
        let mut resp =
            send_rpc(self.rpc_send.as_ref(), self.opts, desc.range_id, replicas, ba).await?;
        if let Some(err) = resp.take_error() {
            return Err(err);
        }
        match resp.responses.into_iter().next() {
            Some(Response::RangeLookup(lookup)) => Ok(lookup.ranges),
            other => Err(internal(format!(
                "unexpected response to range lookup: {other:?}"
            ))),
        }
    }

    async fn first_range(&self) -> Result<RangeDescriptor, KvError> {
        self.gossip.first_range_descriptor().map_err(|err| {
            tracing::debug!(error = %err, "first range descriptor unavailable");
            KvError::FirstRangeMissing
        })
    }
}

enum ChunkOutcome {
    Done(BatchResponse),
    /// The trailing `EndTransaction` may span ranges; send it separately.
    SplitEndTxn,
}

enum RangeStep {
    Reply {
        desc: Arc<RangeDescriptor>,
        resp: BatchResponse,
        need_another: bool,
    },
    SplitEndTxn,
}

/// Routes batches to the ranges that own their keys.
pub struct DistSender {
    config: DistSenderConfig,
    gossip: Arc<dyn ClusterInfo>,
    clock: Arc<HybridClock>,
    rpc_send: Arc<dyn RpcSend>,
    range_cache: RangeDescriptorCache,
    leader_cache: LeaderCache,
    node_descriptor: RwLock<Option<Arc<NodeDescriptor>>>,
    stats: Arc<SenderStats>,
}

impl DistSender {
    /// Sender over `rpc`'s transport, with range lookups served by the
    /// cluster's meta ranges.
    pub fn new(
        config: DistSenderConfig,
        gossip: Arc<dyn ClusterInfo>,
        rpc: Arc<RpcContext>,
    ) -> Self {
        let stats = Arc::new(SenderStats::default());
        let rpc_send = Arc::new(ReplicaSender::new(
            rpc,
            config.enable_local_calls,
            stats.clone(),
        ));
        Self::build(config, gossip, rpc_send, stats)
    }

    /// Sender over an arbitrary replica sender.
    pub fn with_rpc_send(
        config: DistSenderConfig,
        gossip: Arc<dyn ClusterInfo>,
        rpc_send: Arc<dyn RpcSend>,
    ) -> Self {
        Self::build(config, gossip, rpc_send, Arc::new(SenderStats::default()))
    }

    fn build(
        config: DistSenderConfig,
        gossip: Arc<dyn ClusterInfo>,
        rpc_send: Arc<dyn RpcSend>,
        stats: Arc<SenderStats>,
    ) -> Self {
        let db = Arc::new(ClusterRangeDescriptorDb::new(
            gossip.clone(),
            rpc_send.clone(),
            &config,
        ));
        let range_cache =
            RangeDescriptorCache::new(db, config.range_descriptor_cache_size, stats.clone());
        let leader_cache = LeaderCache::new(config.leader_cache_size);
        let node_descriptor = config.node_descriptor.clone().map(Arc::new);
        Self {
            config,
            gossip,
            clock: Arc::new(HybridClock::new()),
            rpc_send,
            range_cache,
            leader_cache,
            node_descriptor: RwLock::new(node_descriptor),
            stats,
        }
    }

    /// Replace the source of range descriptors. Drops everything cached.
    pub fn with_range_descriptor_db(mut self, db: Arc<dyn RangeDescriptorDb>) -> Self {
        self.range_cache = RangeDescriptorCache::new(
            db,
            self.config.range_descriptor_cache_size,
            self.stats.clone(),
        );
        self
    }

    /// Replace the clock that stamps inconsistent reads.
    pub fn with_clock(mut self, clock: Arc<HybridClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> &Arc<SenderStats> {
        &self.stats
    }

    pub fn range_cache(&self) -> &RangeDescriptorCache {
        &self.range_cache
    }

    pub fn leader_cache(&self) -> &LeaderCache {
        &self.leader_cache
    }

    /// Execute `ba` against the ranges its keys fall in and return the
    /// combined reply.
    pub async fn send(&self, ba: BatchRequest) -> Result<BatchResponse, KvError> {
        let span = tracing::debug_span!("dist_sender", requests = ba.requests.len());
        self.send_batch(ba).instrument(span).await
    }

    /// Validate and split `ba`, then send its parts in order.
    ///
    /// Inputs:
    /// - `ba`: non-empty batch. With `max_scan_results` set it may only hold
    ///   scans of one direction.
    ///
    /// Output:
    /// - Replies for every request in request order. The header comes from
    ///   the last part, with the transaction chained through all parts.
    async fn send_batch(&self, mut ba: BatchRequest) -> Result<BatchResponse, KvError> {
        self.stats.record_batch();
        if ba.is_empty() {
            return Err(internal("empty batch".to_string()));
        }

        if ba.header.read_consistency == ReadConsistency::Inconsistent
            && ba.header.timestamp.is_zero()
        {
            ba.header.timestamp = self.clock.now();
        }
        if let Some(txn) = ba.header.txn.as_mut() {
            if txn.observed_timestamps.is_empty() {
                if let Some(node) = self.node_descriptor() {
                    txn.update_observed_timestamp(node.node_id, txn.orig_timestamp);
                }
            }
        }

        if ba.header.max_scan_results != 0 {
            let mut forward = false;
            let mut reverse = false;
            for req in &ba.requests {
                match req.method() {
                    Method::Scan => forward = true,
                    Method::ReverseScan => reverse = true,
                    _ => {
                        return Err(KvError::InvalidBatch(
                            "batch with limit contains non-scan requests".to_string(),
                        ))
                    }
                }
                if forward && reverse {
                    return Err(KvError::InvalidBatch(
                        "batch with limit contains both forward and reverse scans".to_string(),
                    ));
                }
            }
        }

        let mut parts = ba.split(false);
        if ba.header.max_scan_results != 0 && parts.len() != 1 {
            return Err(internal(format!(
                "batch with limit should have exactly one part, got {}",
                parts.len()
            )));
        }

        let mut responses = Vec::with_capacity(ba.requests.len());
        let mut header = None;
        let mut resplit = false;
        let mut i = 0;
        while i < parts.len() {
            let part = BatchRequest {
                header: ba.header.clone(),
                requests: parts[i].clone(),
            };
            match self.send_chunk(part).await? {
                ChunkOutcome::Done(resp) => {
                    if let (Some(txn), Some(reply_txn)) =
                        (ba.header.txn.as_mut(), resp.header.txn.as_ref())
                    {
                        txn.update(reply_txn);
                    }
                    responses.extend(resp.responses);
                    header = Some(resp.header);
                    i += 1;
                }
                ChunkOutcome::SplitEndTxn => {
                    if resplit || i + 1 != parts.len() {
                        return Err(internal(format!(
                            "EndTransaction not in last part of batch: {ba}"
                        )));
                    }
                    let last = BatchRequest {
                        header: ba.header.clone(),
                        requests: parts.remove(i),
                    };
                    let split = last.split(true);
                    if split.len() != 2 {
                        return Err(internal(format!(
                            "split of final EndTransaction part resulted in {} parts",
                            split.len()
                        )));
                    }
                    tracing::debug!("sending EndTransaction separately");
                    parts.extend(split);
                    resplit = true;
                }
            }
        }

        Ok(BatchResponse {
            header: header.unwrap_or_default(),
            responses,
        })
    }

    /// Send one self-contained part, range by range.
    ///
    /// Inputs:
    /// - `ba`: a part produced by `BatchRequest::split`.
    ///
    /// Output:
    /// - `ChunkOutcome::Done` with the combined replies of every range
    ///   visited. Bounded batches stop at the limit and fill skipped slots
    ///   with typed empty replies.
    /// - `ChunkOutcome::SplitEndTxn` when the part must be re-split first.
    async fn send_chunk(&self, mut ba: BatchRequest) -> Result<ChunkOutcome, KvError> {
        let is_reverse = ba.is_reverse();
        let mut rs = keys::batch_range(&ba)?;
        let orig_requests = ba.requests.clone();
        let mut acc: Option<BatchResponse> = None;

        loop {
            let step = self
                .send_to_range(&ba, &rs, is_reverse, acc.is_none())
                .await?;
            let (desc, cur, mut need_another) = match step {
                RangeStep::SplitEndTxn => return Ok(ChunkOutcome::SplitEndTxn),
                RangeStep::Reply {
                    desc,
                    resp,
                    need_another,
                } => (desc, resp, need_another),
            };

            let counts: Vec<Option<i64>> = cur
                .responses
                .iter()
                .map(|r| r.as_countable().map(|c| c.count()))
                .collect();
            if let (Some(txn), Some(reply_txn)) = (ba.header.txn.as_mut(), cur.header.txn.as_ref())
            {
                txn.update(reply_txn);
            }
            let mut br = match acc.take() {
                Some(mut br) => {
                    br.combine(cur)?;
                    br
                }
                None => cur,
            };

            if ba.header.max_scan_results > 0 {
                let results: i64 = counts.iter().flatten().sum();
                if results > ba.header.max_scan_results {
                    return Err(internal(format!(
                        "received {results} results, limit was {}",
                        ba.header.max_scan_results
                    )));
                }
                ba.header.max_scan_results -= results;
                if ba.header.max_scan_results == 0 {
                    for (slot, req) in br.responses.iter_mut().zip(&orig_requests) {
                        if matches!(slot, Response::Noop) {
                            if let Some(empty) = Response::empty_for(req) {
                                *slot = empty;
                            }
                        }
                    }
                    return Ok(ChunkOutcome::Done(br));
                }
            }

            if need_another {
                need_another = false;
                for (i, req) in ba.requests.iter_mut().enumerate() {
                    if matches!(req, Request::Noop) {
                        continue;
                    }
                    let count = counts.get(i).copied().flatten();
                    let next_bound = match (req.as_bounded().map(|b| b.bound()), count) {
                        (Some(bound), Some(count)) if bound > 0 => bound - count,
                        _ => {
                            need_another = true;
                            continue;
                        }
                    };
                    if next_bound <= 0 {
                        *req = Request::Noop;
                        continue;
                    }
                    need_another = true;
                    if let Some(bounded) = req.as_bounded_mut() {
                        bounded.set_bound(next_bound);
                    }
                }
            }
            if !need_another {
                return Ok(ChunkOutcome::Done(br));
            }

            if is_reverse {
                rs.end_key = keys::prev(&ba, &desc.start_key)?;
            } else {
                rs.key = keys::next(&ba, &desc.end_key)?;
            }
            if rs.key >= rs.end_key {
                return Ok(ChunkOutcome::Done(br));
            }
            acc = Some(br);
        }
    }

    /// Send `ba` to the range at the leading (trailing, for `is_reverse`)
    /// edge of `rs`, retrying until that range answers or the error is
    /// terminal.
    ///
    /// Inputs:
    /// - `rs`: the part of the batch's span not yet covered by earlier ranges.
    /// - `first_range`: no range of this part has answered yet, so the
    ///   multi-range checks for transactions still apply.
    ///
    /// Output:
    /// - `RangeStep::Reply` with the descriptor that answered and whether the
    ///   span continues past it.
    /// - `RangeStep::SplitEndTxn` when a trailing `EndTransaction` must be
    ///   sent on its own.
    async fn send_to_range(
        &self,
        ba: &BatchRequest,
        rs: &RSpan,
        is_reverse: bool,
        first_range: bool,
    ) -> Result<RangeStep, KvError> {
        let desc_key = if is_reverse { &rs.end_key } else { &rs.key };
        let mut retry = Retry::start(self.config.retry.clone());
        let mut consider_intents = false;
        let mut refreshes = 0u64;
        let mut last_err: Option<KvError> = None;

        while retry.next().await {
            if last_err.is_some() {
                self.stats.record_retry();
            }
            let desc = match self
                .range_cache
                .lookup_range_descriptor(desc_key, consider_intents, is_reverse)
                .await
            {
                Ok(desc) => desc,
                Err(err) => {
                    tracing::debug!(key = %desc_key, error = %err, "range descriptor lookup failed");
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_err = Some(err);
                    continue;
                }
            };

            let need_another = if is_reverse {
                rs.key < desc.start_key
            } else {
                desc.end_key < rs.end_key
            };
            if need_another && first_range {
                if ba.header.txn.is_none()
                    && ba.is_possible_transaction()
                    && ba.header.read_consistency != ReadConsistency::Inconsistent
                {
                    return Err(KvError::OpRequiresTxn);
                }
                if ba.requests.len() > 1 && ba.last_method() == Some(Method::EndTransaction) {
                    return Ok(RangeStep::SplitEndTxn);
                }
            }

            let covers_edge = if is_reverse {
                desc.contains_exclusive_end_key(&rs.end_key)
            } else {
                desc.contains_key(&rs.key)
            };
            if !covers_edge {
                self.range_cache.evict(desc_key, Some(&desc), is_reverse);
                self.record_refresh(&mut refreshes, desc.range_id, "descriptor misses edge");
                retry.reset();
                continue;
            }

            let err = match self.send_truncated(ba, rs, &desc).await {
                Ok(resp) => {
                    return Ok(RangeStep::Reply {
                        desc,
                        resp,
                        need_another,
                    })
                }
                Err(err) => err,
            };
            tracing::debug!(range_id = desc.range_id, error = %err, "failed to send to range");

            match classify_error(&err, &desc) {
                RetryDecision::EvictAndRetry => {
                    self.range_cache.evict(desc_key, Some(&desc), is_reverse);
                }
                RetryDecision::EvictAndAbort => {
                    self.range_cache.evict(desc_key, Some(&desc), is_reverse);
                    return Err(err);
                }
                RetryDecision::EvictAndRefresh => {
                    self.range_cache.evict(desc_key, Some(&desc), is_reverse);
                    self.record_refresh(&mut refreshes, desc.range_id, "stale descriptor");
                    retry.reset();
                    consider_intents =
                        rand::thread_rng().gen::<f64>() < self.config.intent_lookup_probability;
                }
                RetryDecision::UpdateLeaderAndRetry(leader) => {
                    self.update_leader_cache(desc.range_id, Some(leader));
                    retry.reset();
                }
                RetryDecision::EvictAndClearLeader => {
                    self.range_cache.evict(desc_key, Some(&desc), is_reverse);
                    self.update_leader_cache(desc.range_id, None);
                    self.record_refresh(&mut refreshes, desc.range_id, "leader outside descriptor");
                    retry.reset();
                }
                RetryDecision::Retry => {}
                RetryDecision::Abort => return Err(err),
            }
            last_err = Some(err);
        }

        Err(last_err.unwrap_or(KvError::NodeUnavailable))
    }

    async fn send_truncated(
        &self,
        ba: &BatchRequest,
        rs: &RSpan,
        desc: &RangeDescriptor,
    ) -> Result<BatchResponse, KvError> {
        let intersected = rs.intersect(desc)?;
        let (truncated, active) = keys::truncate(ba, &intersected)?;
        if active == 0 {
            return Err(internal(format!(
                "truncation resulted in empty batch on [{}, {}): {ba}",
                rs.key, rs.end_key
            )));
        }
        self.send_single_range(truncated, desc).await
    }

    /// Order the replicas of `desc` (leader first when known) and hand the
    /// batch to the replica sender. An error in the reply header becomes the
    /// call's error.
    async fn send_single_range(
        &self,
        mut ba: BatchRequest,
        desc: &RangeDescriptor,
    ) -> Result<BatchResponse, KvError> {
        let mut replicas = ReplicaSlice::new(self.gossip.as_ref(), desc);
        let mut ordering = self.optimize_replica_order(&mut replicas);

        if !ba.is_inconsistent_read() && desc.range_id != 0 {
            if let Some(leader) = self.leader_cache.lookup(desc.range_id) {
                if let Some(i) = replicas.find_replica(leader.store_id) {
                    replicas.move_to_front(i);
                    ordering = OrderingPolicy::Stable;
                }
            }
        }

        ba.set_new_request();
        self.stats.record_range_dispatch();
        tracing::trace!(range_id = desc.range_id, batch = %ba, ?ordering, "sending to range");
        let opts = SendOptions {
            ordering,
            send_next_timeout: self.config.send_next_timeout,
            timeout: self.config.rpc_timeout,
        };
        let mut resp =
            send_rpc(self.rpc_send.as_ref(), opts, desc.range_id, replicas, ba).await?;
        match resp.take_error() {
            Some(err) => Err(err),
            None => Ok(resp),
        }
    }

    /// Bias `replicas` towards the local node: attribute affinity first, then
    /// a replica on this very node. Random ordering unless something was
    /// learned.
    fn optimize_replica_order(&self, replicas: &mut ReplicaSlice) -> OrderingPolicy {
        let Some(node) = self.node_descriptor() else {
            return OrderingPolicy::Random;
        };
        let mut ordering = OrderingPolicy::Random;
        if replicas.sort_by_common_attribute_prefix(&node.attrs) > 0 {
            ordering = OrderingPolicy::Stable;
        }
        if let Some(i) = replicas.find_replica_by_node_id(node.node_id) {
            if i > 0 {
                replicas.move_to_front(i);
            }
            ordering = OrderingPolicy::Stable;
        }
        ordering
    }

    /// Count an immediate retry that skipped the backoff. These do not spend
    /// the retry budget, so the per-range total is traced and exported.
    fn record_refresh(&self, refreshes: &mut u64, range_id: RangeId, reason: &'static str) {
        *refreshes += 1;
        self.stats.record_routing_refresh();
        tracing::trace!(
            range_id,
            refreshes = *refreshes,
            reason,
            "refreshing routing without backoff"
        );
    }

    fn update_leader_cache(&self, range_id: RangeId, leader: Option<ReplicaDescriptor>) {
        let old_store = self
            .leader_cache
            .lookup(range_id)
            .map_or(0, |r| r.store_id);
        let new_store = leader.map_or(0, |r| r.store_id);
        if old_store == new_store {
            return;
        }
        tracing::debug!(range_id, old_store, new_store, "range leader changed");
        self.leader_cache.update(range_id, leader);
        self.stats.record_leader_update();
    }

    /// Descriptor of the local node, loaded from gossip on first use.
    fn node_descriptor(&self) -> Option<Arc<NodeDescriptor>> {
        if let Some(desc) = self
            .node_descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Some(Arc::clone(desc));
        }
        let node_id = self.gossip.own_node_id()?;
        match self.gossip.node_descriptor(node_id) {
            Ok(desc) => {
                let desc = Arc::new(desc);
                *self
                    .node_descriptor
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&desc));
                tracing::debug!(node_id, "loaded local node descriptor");
                Some(desc)
            }
            Err(err) => {
                tracing::trace!(node_id, error = %err, "local node descriptor not available yet");
                None
            }
        }
    }
}

#[async_trait]
impl Sender for DistSender {
    async fn send(&self, ba: BatchRequest) -> Result<BatchResponse, KvError> {
        DistSender::send(self, ba).await
    }
}
