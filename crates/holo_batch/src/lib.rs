//! Batch data model for the range-routing client.
//!
//! This crate holds the types shared by the distributed sender and the
//! replicas it talks to: keys and spans, range/replica/node descriptors,
//! hybrid-logical timestamps, transactions, the closed set of request and
//! response variants, and the error taxonomy carried in response headers.
//! It stays dependency-light so that both sides of the wire can use it.

pub mod api;
pub mod batch;
pub mod data;
pub mod error;
pub mod txn;

pub use api::{
    Bounded, Combinable, Countable, KeyValue, Method, Request, Response, ScanRequest,
    ScanResponse,
};
pub use batch::{BatchHeader, BatchRequest, BatchResponse, BatchResponseHeader, ReadConsistency};
pub use data::{
    Key, NodeDescriptor, NodeId, RKey, RSpan, RangeDescriptor, RangeId, ReplicaDescriptor,
    ReplicaId, Span, StoreId, Timestamp, KEY_MAX,
};
pub use error::KvError;
pub use txn::{Transaction, TransactionStatus};
