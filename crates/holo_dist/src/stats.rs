//! Routing counters shared by the distributed and multi-replica senders.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated on the send path. All updates are relaxed; readers only
/// ever see a point-in-time `SenderStatsSnapshot`.
#[derive(Default)]
pub struct SenderStats {
    batches: AtomicU64,
    range_dispatches: AtomicU64,
    rpcs_sent: AtomicU64,
    local_calls: AtomicU64,
    send_next_timeouts: AtomicU64,
    replica_errors: AtomicU64,
    range_lookups: AtomicU64,
    descriptor_evictions: AtomicU64,
    leader_updates: AtomicU64,
    retries: AtomicU64,
    routing_refreshes: AtomicU64,
}

/// Snapshot of `SenderStats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SenderStatsSnapshot {
    /// Batches accepted by `DistSender::send`.
    pub batches: u64,
    /// Single-range sub-batches handed to the replica sender.
    pub range_dispatches: u64,
    /// RPCs dispatched to individual replicas (local calls included).
    pub rpcs_sent: u64,
    pub local_calls: u64,
    pub send_next_timeouts: u64,
    pub replica_errors: u64,
    /// Authoritative range lookups issued on descriptor cache misses.
    pub range_lookups: u64,
    pub descriptor_evictions: u64,
    pub leader_updates: u64,
    pub retries: u64,
    /// Retries that refreshed routing and skipped the backoff. They are not
    /// bounded by `max_retries`.
    pub routing_refreshes: u64,
}

impl SenderStats {
    pub fn snapshot(&self) -> SenderStatsSnapshot {
        SenderStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            range_dispatches: self.range_dispatches.load(Ordering::Relaxed),
            rpcs_sent: self.rpcs_sent.load(Ordering::Relaxed),
            local_calls: self.local_calls.load(Ordering::Relaxed),
            send_next_timeouts: self.send_next_timeouts.load(Ordering::Relaxed),
            replica_errors: self.replica_errors.load(Ordering::Relaxed),
            range_lookups: self.range_lookups.load(Ordering::Relaxed),
            descriptor_evictions: self.descriptor_evictions.load(Ordering::Relaxed),
            leader_updates: self.leader_updates.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            routing_refreshes: self.routing_refreshes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_range_dispatch(&self) {
        self.range_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rpc(&self, local: bool) {
        self.rpcs_sent.fetch_add(1, Ordering::Relaxed);
        if local {
            self.local_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_send_next_timeout(&self) {
        self.send_next_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replica_error(&self) {
        self.replica_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_range_lookup(&self) {
        self.range_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.descriptor_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_leader_update(&self) {
        self.leader_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_routing_refresh(&self) {
        self.routing_refreshes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = SenderStats::default();
        stats.record_rpc(false);
        stats.record_rpc(true);
        stats.record_retry();
        stats.record_routing_refresh();
        let snap = stats.snapshot();
        assert_eq!(snap.rpcs_sent, 2);
        assert_eq!(snap.local_calls, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.routing_refreshes, 1);
        assert_eq!(snap.batches, 0);

        let json = serde_json::to_value(&snap).expect("serialize");
        assert_eq!(json["rpcs_sent"], 2);
    }
}
