//! Batches of requests and their responses.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::flags::{IS_ADMIN, IS_ALONE, IS_READ, IS_REVERSE, IS_TXN, IS_WRITE};
use crate::api::{Method, Request, Response};
use crate::data::{RangeId, ReplicaDescriptor, Timestamp};
use crate::error::KvError;
use crate::txn::Transaction;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    #[default]
    Consistent,
    /// Served by any replica without a lease check; may be stale.
    Inconsistent,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub timestamp: Timestamp,
    /// Replica the batch is addressed to; set per dispatch.
    pub replica: Option<ReplicaDescriptor>,
    /// Range the batch is addressed to; set per dispatch.
    pub range_id: RangeId,
    pub txn: Option<Transaction>,
    pub read_consistency: ReadConsistency,
    /// Limit on scan results across the whole batch (`0` = unbounded).
    pub max_scan_results: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub header: BatchHeader,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requests(requests: Vec<Request>) -> Self {
        Self {
            header: BatchHeader::default(),
            requests,
        }
    }

    pub fn add(&mut self, req: Request) -> &mut Self {
        self.requests.push(req);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn has_flag(&self, flag: u32) -> bool {
        self.requests.iter().any(|r| r.flags() & flag != 0)
    }

    pub fn is_read_only(&self) -> bool {
        let mut all = 0;
        for req in &self.requests {
            all |= req.flags();
        }
        all & IS_READ != 0 && all & (IS_WRITE | IS_ADMIN) == 0
    }

    pub fn is_reverse(&self) -> bool {
        self.has_flag(IS_REVERSE)
    }

    /// Whether the batch holds requests that may run inside a transaction.
    pub fn is_possible_transaction(&self) -> bool {
        self.has_flag(IS_TXN)
    }

    pub fn is_inconsistent_read(&self) -> bool {
        self.header.read_consistency == ReadConsistency::Inconsistent && self.is_read_only()
    }

    pub fn last_method(&self) -> Option<Method> {
        self.requests.last().map(Request::method)
    }

    /// Prepare the batch for one more dispatch: bump the sequence of a
    /// carried transaction.
    pub fn set_new_request(&mut self) {
        if let Some(txn) = self.header.txn.as_mut() {
            txn.sequence += 1;
        }
    }

    /// Partition requests into ordered parts that may each be sent as one
    /// batch. Within a part, non-noop requests agree on their write, admin
    /// and reverse flags, and an `IS_ALONE` request never joins a non-empty
    /// part. `EndTransaction` joins the trailing part unless
    /// `can_split_end_txn` is set.
    pub fn split(&self, can_split_end_txn: bool) -> Vec<Vec<Request>> {
        const MASK: u32 = IS_WRITE | IS_ADMIN | IS_REVERSE;
        let compatible = |method: Method, existing: u32, new: u32| {
            if existing == 0 || (!can_split_end_txn && method == Method::EndTransaction) {
                return true;
            }
            if new & IS_ALONE != 0 {
                return false;
            }
            existing & MASK == new & MASK
        };

        let mut parts = Vec::new();
        let mut rest = &self.requests[..];
        while !rest.is_empty() {
            let mut end = rest.len();
            let mut part_flags = 0;
            for (i, req) in rest.iter().enumerate() {
                let method = req.method();
                if method == Method::Noop {
                    continue;
                }
                let flags = req.flags();
                if !compatible(method, part_flags, flags) {
                    end = i;
                    break;
                }
                part_flags |= flags;
            }
            parts.push(rest[..end].to_vec());
            rest = &rest[end..];
        }
        parts
    }
}

impl fmt::Display for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, req) in self.requests.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let span = req.header();
            if span.end_key.is_empty() {
                write!(f, "{} [{}]", req.method(), span.key)?;
            } else {
                write!(f, "{} [{},{})", req.method(), span.key, span.end_key)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponseHeader {
    pub timestamp: Timestamp,
    pub txn: Option<Transaction>,
    /// Error reported by the replica that executed the batch.
    pub error: Option<KvError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub header: BatchResponseHeader,
    pub responses: Vec<Response>,
}

impl BatchResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, resp: Response) {
        self.responses.push(resp);
    }

    pub fn take_error(&mut self) -> Option<KvError> {
        self.header.error.take()
    }

    /// Merge the response to the same batch from another range.
    pub fn combine(&mut self, other: BatchResponse) -> Result<(), KvError> {
        if other.responses.len() != self.responses.len() {
            return Err(KvError::Internal(format!(
                "unable to combine batch responses of different length ({} vs {})",
                self.responses.len(),
                other.responses.len()
            )));
        }
        for (slot, resp) in self.responses.iter_mut().zip(other.responses) {
            slot.combine(resp);
        }
        if let Some(other_txn) = other.header.txn {
            match self.header.txn.as_mut() {
                Some(txn) => txn.update(&other_txn),
                None => self.header.txn = Some(other_txn),
            }
        }
        self.header.timestamp.forward(other.header.timestamp);
        Ok(())
    }
}
