//! Cluster metadata consumed by the router.

use holo_batch::{NodeDescriptor, NodeId, RangeDescriptor};

/// Read side of the cluster metadata propagated between nodes.
pub trait ClusterInfo: Send + Sync + 'static {
    /// Descriptor of the range that holds the first level of range
    /// metadata. Errors while it has not been propagated yet.
    fn first_range_descriptor(&self) -> anyhow::Result<RangeDescriptor>;

    /// Address and attributes of `node_id`.
    fn node_descriptor(&self, node_id: NodeId) -> anyhow::Result<NodeDescriptor>;

    /// Id of the node this process runs as, once it has joined.
    fn own_node_id(&self) -> Option<NodeId>;
}
