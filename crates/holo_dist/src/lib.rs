//! Client-side routing for a range-partitioned key-value store.
//!
//! `DistSender` takes a batch addressed to arbitrary keys, locates the
//! ranges it touches through a two-level metadata index (cached in a
//! `RangeDescriptorCache`), cuts the batch per range, and hands each part to
//! a `ReplicaSender`, which tries the range's replicas leader-first with
//! staggered fallbacks. Transports, gossip and replica servers are supplied
//! by the embedding process through the traits in `transport` and `gossip`;
//! `sim` provides an in-process cluster implementing all of them.

pub mod clock;
pub mod config;
pub mod dist_sender;
pub mod gossip;
pub mod keys;
pub mod leader_cache;
pub mod lru;
pub mod range_cache;
pub mod replica;
pub mod retry;
pub mod send;
pub mod sim;
pub mod stats;
pub mod transport;

pub use clock::HybridClock;
pub use config::{DistSenderArgs, DistSenderConfig};
pub use dist_sender::{
    classify_error, ClusterRangeDescriptorDb, DistSender, RetryDecision, Sender,
};
pub use gossip::ClusterInfo;
pub use leader_cache::LeaderCache;
pub use range_cache::{RangeDescriptorCache, RangeDescriptorDb};
pub use replica::ReplicaSlice;
pub use retry::{Retry, RetryOptions};
pub use send::{OrderingPolicy, ReplicaSender, RpcSend, SendOptions};
pub use sim::SimCluster;
pub use stats::{SenderStats, SenderStatsSnapshot};
pub use transport::{Connection, ConnectionState, LocalServer, RpcContext, Transport};
