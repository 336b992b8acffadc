//! Replica sets resolved to network addresses, and their ordering.

use std::ops::{Deref, DerefMut};

use holo_batch::{NodeDescriptor, NodeId, RangeDescriptor, ReplicaDescriptor, StoreId};

use crate::gossip::ClusterInfo;

/// A replica together with the node that hosts it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub replica: ReplicaDescriptor,
    pub node: NodeDescriptor,
}

impl ReplicaInfo {
    pub fn address(&self) -> &str {
        &self.node.address
    }

    pub fn attrs(&self) -> &[String] {
        &self.node.attrs
    }
}

/// Ordered candidate replicas for one dispatch. Reordering never changes
/// which replicas are present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaSlice(Vec<ReplicaInfo>);

impl ReplicaSlice {
    /// Resolve the replicas of `desc` through `gossip`. Replicas whose node
    /// address is not known yet are left out.
    pub fn new(gossip: &dyn ClusterInfo, desc: &RangeDescriptor) -> Self {
        let mut replicas = Vec::with_capacity(desc.replicas.len());
        for replica in &desc.replicas {
            match gossip.node_descriptor(replica.node_id) {
                Ok(node) => replicas.push(ReplicaInfo {
                    replica: *replica,
                    node,
                }),
                Err(err) => {
                    tracing::trace!(
                        range_id = desc.range_id,
                        node_id = replica.node_id,
                        error = %err,
                        "node descriptor not available; skipping replica"
                    );
                }
            }
        }
        Self(replicas)
    }

    pub fn from_vec(replicas: Vec<ReplicaInfo>) -> Self {
        Self(replicas)
    }

    pub fn into_vec(self) -> Vec<ReplicaInfo> {
        self.0
    }

    /// Index of the replica on `store_id`.
    pub fn find_replica(&self, store_id: StoreId) -> Option<usize> {
        self.0.iter().position(|r| r.replica.store_id == store_id)
    }

    /// Index of the replica hosted by `node_id`.
    pub fn find_replica_by_node_id(&self, node_id: NodeId) -> Option<usize> {
        self.0.iter().position(|r| r.replica.node_id == node_id)
    }

    /// Move the replica at `i` to the front, keeping the relative order of
    /// the others.
    pub fn move_to_front(&mut self, i: usize) {
        if i < self.0.len() {
            self.0[..=i].rotate_right(1);
        }
    }

    /// Stable-sort replicas by the length of the prefix their node
    /// attributes share with `attrs`, longest first. Returns the longest
    /// shared prefix length (0 when nothing matches or there is nothing to
    /// order).
    pub fn sort_by_common_attribute_prefix(&mut self, attrs: &[String]) -> usize {
        if self.0.len() < 2 {
            return 0;
        }
        let common = |info: &ReplicaInfo| {
            info.attrs()
                .iter()
                .zip(attrs)
                .take_while(|(a, b)| a == b)
                .count()
        };
        self.0.sort_by_key(|info| std::cmp::Reverse(common(info)));
        self.0.first().map(common).unwrap_or(0)
    }
}

impl Deref for ReplicaSlice {
    type Target = [ReplicaInfo];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ReplicaSlice {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
