//! Request and response variants.
//!
//! Both sides are closed sum types. Capabilities that only some variants
//! have (a result bound, a result count, cross-range merging) are expressed
//! as traits and recovered with `as_bounded`/`as_countable`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::{Key, RangeDescriptor, Span};

/// Request property flags used for batch splitting and routing decisions.
pub mod flags {
    pub const IS_READ: u32 = 1 << 0;
    pub const IS_WRITE: u32 = 1 << 1;
    /// May be part of a transaction.
    pub const IS_TXN: u32 = 1 << 2;
    /// Writes transactional data (intents).
    pub const IS_TXN_WRITE: u32 = 1 << 3;
    /// Addresses a span rather than a single key.
    pub const IS_RANGE: u32 = 1 << 4;
    pub const IS_REVERSE: u32 = 1 << 5;
    pub const IS_ADMIN: u32 = 1 << 6;
    /// Must be the only non-noop request of its kind in a batch part.
    pub const IS_ALONE: u32 = 1 << 7;
}

use flags::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Put,
    ConditionalPut,
    Increment,
    Delete,
    DeleteRange,
    Scan,
    ReverseScan,
    BeginTransaction,
    EndTransaction,
    RangeLookup,
    AdminSplit,
    Noop,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Requests that carry a per-request result bound (`0` = unbounded).
pub trait Bounded {
    fn bound(&self) -> i64;
    fn set_bound(&mut self, bound: i64);
}

/// Responses that report how many results they hold.
pub trait Countable {
    fn count(&self) -> i64;
}

/// Responses that are merged when a request spans several ranges.
pub trait Combinable {
    fn combine(&mut self, other: Self);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    pub span: Span,
    pub value: Vec<u8>,
}

/// Put that only applies if the current value equals `exp_value`
/// (`None` = key absent).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalPutRequest {
    pub span: Span,
    pub value: Vec<u8>,
    pub exp_value: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementRequest {
    pub span: Span,
    pub increment: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRangeRequest {
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub span: Span,
    pub max_results: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseScanRequest {
    pub span: Span,
    pub max_results: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginTransactionRequest {
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndTransactionRequest {
    pub span: Span,
    pub commit: bool,
}

/// Lookup of the descriptor addressed by a meta key, plus up to
/// `max_ranges - 1` neighbours in the lookup direction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeLookupRequest {
    pub span: Span,
    pub max_ranges: usize,
    pub consider_intents: bool,
    pub reverse: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSplitRequest {
    pub span: Span,
    pub split_key: Key,
}

impl Bounded for ScanRequest {
    fn bound(&self) -> i64 {
        self.max_results
    }

    fn set_bound(&mut self, bound: i64) {
        self.max_results = bound;
    }
}

impl Bounded for ReverseScanRequest {
    fn bound(&self) -> i64 {
        self.max_results
    }

    fn set_bound(&mut self, bound: i64) {
        self.max_results = bound;
    }
}

static EMPTY_SPAN: Span = Span::empty();

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Get(GetRequest),
    Put(PutRequest),
    ConditionalPut(ConditionalPutRequest),
    Increment(IncrementRequest),
    Delete(DeleteRequest),
    DeleteRange(DeleteRangeRequest),
    Scan(ScanRequest),
    ReverseScan(ReverseScanRequest),
    BeginTransaction(BeginTransactionRequest),
    EndTransaction(EndTransactionRequest),
    RangeLookup(RangeLookupRequest),
    AdminSplit(AdminSplitRequest),
    /// Placeholder for a request that does not apply to the current range.
    Noop,
}

impl Request {
    pub fn get(key: impl Into<Key>) -> Self {
        Request::Get(GetRequest {
            span: Span::point(key),
        })
    }

    pub fn put(key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Self {
        Request::Put(PutRequest {
            span: Span::point(key),
            value: value.into(),
        })
    }

    pub fn conditional_put(
        key: impl Into<Key>,
        value: impl Into<Vec<u8>>,
        exp_value: Option<Vec<u8>>,
    ) -> Self {
        Request::ConditionalPut(ConditionalPutRequest {
            span: Span::point(key),
            value: value.into(),
            exp_value,
        })
    }

    pub fn increment(key: impl Into<Key>, increment: i64) -> Self {
        Request::Increment(IncrementRequest {
            span: Span::point(key),
            increment,
        })
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Request::Delete(DeleteRequest {
            span: Span::point(key),
        })
    }

    pub fn delete_range(key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Request::DeleteRange(DeleteRangeRequest {
            span: Span::new(key, end_key),
        })
    }

    pub fn scan(key: impl Into<Key>, end_key: impl Into<Key>, max_results: i64) -> Self {
        Request::Scan(ScanRequest {
            span: Span::new(key, end_key),
            max_results,
        })
    }

    pub fn reverse_scan(key: impl Into<Key>, end_key: impl Into<Key>, max_results: i64) -> Self {
        Request::ReverseScan(ReverseScanRequest {
            span: Span::new(key, end_key),
            max_results,
        })
    }

    pub fn begin_transaction(key: impl Into<Key>) -> Self {
        Request::BeginTransaction(BeginTransactionRequest {
            span: Span::point(key),
        })
    }

    pub fn end_transaction(key: impl Into<Key>, commit: bool) -> Self {
        Request::EndTransaction(EndTransactionRequest {
            span: Span::point(key),
            commit,
        })
    }

    pub fn range_lookup(
        key: impl Into<Key>,
        max_ranges: usize,
        consider_intents: bool,
        reverse: bool,
    ) -> Self {
        Request::RangeLookup(RangeLookupRequest {
            span: Span::point(key),
            max_ranges,
            consider_intents,
            reverse,
        })
    }

    pub fn admin_split(key: impl Into<Key>, split_key: impl Into<Key>) -> Self {
        Request::AdminSplit(AdminSplitRequest {
            span: Span::point(key),
            split_key: split_key.into(),
        })
    }

    pub fn method(&self) -> Method {
        match self {
            Request::Get(_) => Method::Get,
            Request::Put(_) => Method::Put,
            Request::ConditionalPut(_) => Method::ConditionalPut,
            Request::Increment(_) => Method::Increment,
            Request::Delete(_) => Method::Delete,
            Request::DeleteRange(_) => Method::DeleteRange,
            Request::Scan(_) => Method::Scan,
            Request::ReverseScan(_) => Method::ReverseScan,
            Request::BeginTransaction(_) => Method::BeginTransaction,
            Request::EndTransaction(_) => Method::EndTransaction,
            Request::RangeLookup(_) => Method::RangeLookup,
            Request::AdminSplit(_) => Method::AdminSplit,
            Request::Noop => Method::Noop,
        }
    }

    pub fn flags(&self) -> u32 {
        match self.method() {
            Method::Get => IS_READ | IS_TXN,
            Method::Put | Method::ConditionalPut | Method::Increment | Method::Delete => {
                IS_WRITE | IS_TXN | IS_TXN_WRITE
            }
            Method::DeleteRange => IS_WRITE | IS_TXN | IS_TXN_WRITE | IS_RANGE,
            Method::Scan => IS_READ | IS_TXN | IS_RANGE,
            Method::ReverseScan => IS_READ | IS_TXN | IS_RANGE | IS_REVERSE,
            Method::BeginTransaction => IS_WRITE | IS_TXN,
            Method::EndTransaction => IS_WRITE | IS_TXN | IS_ALONE,
            Method::RangeLookup => IS_READ,
            Method::AdminSplit => IS_ADMIN | IS_ALONE,
            Method::Noop => 0,
        }
    }

    pub fn is_range(&self) -> bool {
        self.flags() & IS_RANGE != 0
    }

    /// Key span addressed by the request. `Noop` has an empty span.
    pub fn header(&self) -> &Span {
        match self {
            Request::Get(r) => &r.span,
            Request::Put(r) => &r.span,
            Request::ConditionalPut(r) => &r.span,
            Request::Increment(r) => &r.span,
            Request::Delete(r) => &r.span,
            Request::DeleteRange(r) => &r.span,
            Request::Scan(r) => &r.span,
            Request::ReverseScan(r) => &r.span,
            Request::BeginTransaction(r) => &r.span,
            Request::EndTransaction(r) => &r.span,
            Request::RangeLookup(r) => &r.span,
            Request::AdminSplit(r) => &r.span,
            Request::Noop => &EMPTY_SPAN,
        }
    }

    pub fn header_mut(&mut self) -> Option<&mut Span> {
        match self {
            Request::Get(r) => Some(&mut r.span),
            Request::Put(r) => Some(&mut r.span),
            Request::ConditionalPut(r) => Some(&mut r.span),
            Request::Increment(r) => Some(&mut r.span),
            Request::Delete(r) => Some(&mut r.span),
            Request::DeleteRange(r) => Some(&mut r.span),
            Request::Scan(r) => Some(&mut r.span),
            Request::ReverseScan(r) => Some(&mut r.span),
            Request::BeginTransaction(r) => Some(&mut r.span),
            Request::EndTransaction(r) => Some(&mut r.span),
            Request::RangeLookup(r) => Some(&mut r.span),
            Request::AdminSplit(r) => Some(&mut r.span),
            Request::Noop => None,
        }
    }

    pub fn as_bounded(&self) -> Option<&dyn Bounded> {
        match self {
            Request::Scan(r) => Some(r),
            Request::ReverseScan(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_bounded_mut(&mut self) -> Option<&mut dyn Bounded> {
        match self {
            Request::Scan(r) => Some(r),
            Request::ReverseScan(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Key,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementResponse {
    pub new_value: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRangeResponse {
    pub keys_deleted: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub rows: Vec<KeyValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseScanResponse {
    pub rows: Vec<KeyValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndTransactionResponse {
    /// Committed together with all of its writes in one single-range batch.
    pub one_phase_commit: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeLookupResponse {
    pub ranges: Vec<RangeDescriptor>,
}

impl Countable for ScanResponse {
    fn count(&self) -> i64 {
        self.rows.len() as i64
    }
}

impl Countable for ReverseScanResponse {
    fn count(&self) -> i64 {
        self.rows.len() as i64
    }
}

impl Combinable for ScanResponse {
    fn combine(&mut self, other: Self) {
        self.rows.extend(other.rows);
    }
}

impl Combinable for ReverseScanResponse {
    fn combine(&mut self, other: Self) {
        self.rows.extend(other.rows);
    }
}

impl Combinable for DeleteRangeResponse {
    fn combine(&mut self, other: Self) {
        self.keys_deleted += other.keys_deleted;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Get(GetResponse),
    Put,
    ConditionalPut,
    Increment(IncrementResponse),
    Delete,
    DeleteRange(DeleteRangeResponse),
    Scan(ScanResponse),
    ReverseScan(ReverseScanResponse),
    BeginTransaction,
    EndTransaction(EndTransactionResponse),
    RangeLookup(RangeLookupResponse),
    AdminSplit,
    Noop,
}

impl Response {
    pub fn method(&self) -> Method {
        match self {
            Response::Get(_) => Method::Get,
            Response::Put => Method::Put,
            Response::ConditionalPut => Method::ConditionalPut,
            Response::Increment(_) => Method::Increment,
            Response::Delete => Method::Delete,
            Response::DeleteRange(_) => Method::DeleteRange,
            Response::Scan(_) => Method::Scan,
            Response::ReverseScan(_) => Method::ReverseScan,
            Response::BeginTransaction => Method::BeginTransaction,
            Response::EndTransaction(_) => Method::EndTransaction,
            Response::RangeLookup(_) => Method::RangeLookup,
            Response::AdminSplit => Method::AdminSplit,
            Response::Noop => Method::Noop,
        }
    }

    pub fn as_countable(&self) -> Option<&dyn Countable> {
        match self {
            Response::Scan(r) => Some(r),
            Response::ReverseScan(r) => Some(r),
            _ => None,
        }
    }

    /// Empty response of the kind `req` expects, for bounded requests that
    /// were never executed because the batch limit was already reached.
    pub fn empty_for(req: &Request) -> Option<Response> {
        match req {
            Request::Scan(_) => Some(Response::Scan(ScanResponse::default())),
            Request::ReverseScan(_) => Some(Response::ReverseScan(ReverseScanResponse::default())),
            _ => None,
        }
    }

    /// Merge the response for the same request slot from another range.
    ///
    /// A `Noop` slot takes the other side's value. Non-combinable slots keep
    /// the value already present.
    pub fn combine(&mut self, other: Response) {
        if matches!(self, Response::Noop) {
            *self = other;
            return;
        }
        match (self, other) {
            (Response::Scan(left), Response::Scan(right)) => left.combine(right),
            (Response::ReverseScan(left), Response::ReverseScan(right)) => left.combine(right),
            (Response::DeleteRange(left), Response::DeleteRange(right)) => left.combine(right),
            _ => {}
        }
    }

    pub fn rows(&self) -> &[KeyValue] {
        match self {
            Response::Scan(r) => &r.rows,
            Response::ReverseScan(r) => &r.rows,
            _ => &[],
        }
    }
}
