//! Transaction snapshots carried by batches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::{Key, NodeId, Timestamp};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    #[default]
    Pending,
    Committed,
    Aborted,
}

impl TransactionStatus {
    pub fn is_finalized(self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// Client-visible state of a transaction.
///
/// Replicas return an updated snapshot with every response; the client folds
/// those snapshots together with `update`, which never moves state backwards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub name: String,
    /// Anchor key; the transaction record lives on the range holding it.
    pub key: Key,
    pub epoch: u32,
    pub timestamp: Timestamp,
    pub orig_timestamp: Timestamp,
    pub status: TransactionStatus,
    /// Bumped once per dispatched sub-batch.
    pub sequence: u32,
    /// Set once the transaction has laid down a write.
    pub writing: bool,
    /// Per-node clock readings observed by this transaction.
    pub observed_timestamps: BTreeMap<NodeId, Timestamp>,
}

impl Transaction {
    pub fn new(id: u64, name: impl Into<String>, key: impl Into<Key>, now: Timestamp) -> Self {
        Self {
            id,
            name: name.into(),
            key: key.into(),
            epoch: 0,
            timestamp: now,
            orig_timestamp: now,
            status: TransactionStatus::Pending,
            sequence: 0,
            writing: false,
            observed_timestamps: BTreeMap::new(),
        }
    }

    /// Fold a newer snapshot of the same transaction into `self`.
    pub fn update(&mut self, other: &Transaction) {
        if self.id == 0 {
            *self = other.clone();
            return;
        }
        if self.id != other.id {
            return;
        }
        if other.status.is_finalized() {
            self.status = other.status;
        }
        self.epoch = self.epoch.max(other.epoch);
        self.timestamp.forward(other.timestamp);
        self.orig_timestamp.forward(other.orig_timestamp);
        self.sequence = self.sequence.max(other.sequence);
        self.writing |= other.writing;
        for (node_id, ts) in &other.observed_timestamps {
            self.update_observed_timestamp(*node_id, *ts);
        }
    }

    /// Record a clock reading from `node_id`, keeping the earliest one.
    pub fn update_observed_timestamp(&mut self, node_id: NodeId, ts: Timestamp) {
        self.observed_timestamps
            .entry(node_id)
            .and_modify(|existing| {
                if ts < *existing {
                    *existing = ts;
                }
            })
            .or_insert(ts);
    }
}
