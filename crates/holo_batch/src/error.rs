//! Errors produced while routing and executing batches.
//!
//! `KvError` travels both as a Rust error inside the client and inside a
//! `BatchResponseHeader`, so every variant is serializable.

use serde::{Deserialize, Serialize};

use crate::data::{Key, RangeDescriptor, RangeId, ReplicaDescriptor};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum KvError {
    /// The addressed replica does not (or no longer does) hold the range.
    #[error("r{range_id} was not found")]
    RangeNotFound { range_id: RangeId },

    /// The request span is not contained in the range that received it.
    #[error(
        "key range {request_start}-{request_end} outside of bounds of range {}",
        describe_range(.range)
    )]
    RangeKeyMismatch {
        request_start: Key,
        request_end: Key,
        range: Option<RangeDescriptor>,
    },

    /// The addressed replica does not hold the lease. `leader` is the
    /// replica it believes does, if any.
    #[error("r{range_id}: replica {} is not the leader; leader is {}",
        describe_replica(.replica), describe_replica(.leader))]
    NotLeader {
        range_id: RangeId,
        replica: Option<ReplicaDescriptor>,
        leader: Option<ReplicaDescriptor>,
    },

    /// Every replica contacted for one dispatch failed.
    #[error("{message}")]
    Send { message: String, retryable: bool },

    /// A single RPC failed at the transport level.
    #[error("{message}")]
    Rpc { message: String },

    #[error("the descriptor for the first range is not available via gossip")]
    FirstRangeMissing,

    #[error("no replica node addresses available via gossip for r{range_id}")]
    NoNodeAddrsAvailable { range_id: RangeId },

    /// A non-transactional consistent batch would span ranges.
    #[error("the operation requires transactional context")]
    OpRequiresTxn,

    /// The batch is malformed for the requested execution mode.
    #[error("{0}")]
    InvalidBatch(String),

    #[error("node unavailable; try another peer")]
    NodeUnavailable,

    #[error("unexpected value: {actual:?}")]
    ConditionFailed { actual: Option<Vec<u8>> },

    /// An internal invariant was violated.
    #[error("{0}")]
    Internal(String),
}

impl KvError {
    /// Whether repeating the operation may succeed without caller action.
    ///
    /// Routing-stale errors report retryable: they are resolved by refreshing
    /// routing metadata, both for data batches and for the range lookups that
    /// populate the descriptor cache.
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::RangeNotFound { .. }
            | KvError::RangeKeyMismatch { .. }
            | KvError::NotLeader { .. }
            | KvError::Rpc { .. }
            | KvError::FirstRangeMissing
            | KvError::NoNodeAddrsAvailable { .. }
            | KvError::NodeUnavailable => true,
            KvError::Send { retryable, .. } => *retryable,
            KvError::OpRequiresTxn
            | KvError::InvalidBatch(_)
            | KvError::ConditionFailed { .. }
            | KvError::Internal(_) => false,
        }
    }

    pub fn rpc(message: impl Into<String>) -> Self {
        KvError::Rpc {
            message: message.into(),
        }
    }
}

fn describe_range(range: &Option<RangeDescriptor>) -> String {
    match range {
        Some(desc) => desc.to_string(),
        None => "<unknown>".to_string(),
    }
}

fn describe_replica(replica: &Option<ReplicaDescriptor>) -> String {
    match replica {
        Some(r) => r.to_string(),
        None => "<unknown>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RKey;

    #[test]
    fn retryability() {
        assert!(KvError::rpc("boom").is_retryable());
        assert!(KvError::FirstRangeMissing.is_retryable());
        assert!(!KvError::OpRequiresTxn.is_retryable());
        assert!(!KvError::Send {
            message: "x".into(),
            retryable: false
        }
        .is_retryable());
        assert!(KvError::Send {
            message: "x".into(),
            retryable: true
        }
        .is_retryable());
    }

    #[test]
    fn mismatch_message_names_range() {
        let err = KvError::RangeKeyMismatch {
            request_start: Key::from("a"),
            request_end: Key::from("z"),
            range: Some(RangeDescriptor {
                range_id: 3,
                start_key: RKey::from("a"),
                end_key: RKey::from("g"),
                replicas: Vec::new(),
            }),
        };
        assert_eq!(
            err.to_string(),
            "key range a-z outside of bounds of range r3:[a-g)"
        );
    }

    #[test]
    fn errors_survive_a_response_header_round_trip() {
        let err = KvError::NotLeader {
            range_id: 9,
            replica: None,
            leader: Some(ReplicaDescriptor {
                node_id: 2,
                store_id: 2,
                replica_id: 1,
            }),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let back: KvError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, err);
    }
}
