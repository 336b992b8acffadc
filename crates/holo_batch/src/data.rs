//! Keys, spans and the descriptors used to route them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::KvError;

/// Identifier of a range (a contiguous partition of the keyspace).
pub type RangeId = u64;
/// Identifier of a storage node.
pub type NodeId = u64;
/// Identifier of a store on a node.
pub type StoreId = u64;
/// Identifier of a replica within its range.
pub type ReplicaId = u64;

/// Upper sentinel of the addressable keyspace.
pub const KEY_MAX: &[u8] = b"\xff\xff";

/// Raw key as supplied by a client. May be a local (range-addressed) key.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub Vec<u8>);

impl Key {
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Smallest key strictly greater than `self`.
    pub fn next(&self) -> Key {
        let mut out = Vec::with_capacity(self.0.len() + 1);
        out.extend_from_slice(&self.0);
        out.push(0);
        Key(out)
    }

    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Key {
    fn from(value: &[u8]) -> Self {
        Key(value.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Key(value)
    }
}

impl From<RKey> for Key {
    fn from(value: RKey) -> Self {
        Key(value.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_key(&self.0, f)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_key(&self.0, f)
    }
}

/// Addressed key: a position in the global, range-partitioned keyspace.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RKey(pub Vec<u8>);

impl RKey {
    /// Lower sentinel (the empty key).
    pub const fn min() -> Self {
        Self(Vec::new())
    }

    /// Upper sentinel.
    pub fn max() -> Self {
        Self(KEY_MAX.to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn next(&self) -> RKey {
        let mut out = Vec::with_capacity(self.0.len() + 1);
        out.extend_from_slice(&self.0);
        out.push(0);
        RKey(out)
    }

    pub fn as_raw_key(&self) -> Key {
        Key(self.0.clone())
    }

    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl From<&str> for RKey {
    fn from(value: &str) -> Self {
        RKey(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for RKey {
    fn from(value: &[u8]) -> Self {
        RKey(value.to_vec())
    }
}

impl From<Vec<u8>> for RKey {
    fn from(value: Vec<u8>) -> Self {
        RKey(value)
    }
}

impl fmt::Display for RKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_key(&self.0, f)
    }
}

impl fmt::Debug for RKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_key(&self.0, f)
    }
}

fn fmt_key(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if bytes.is_empty() {
        return f.write_str("/Min");
    }
    if bytes == KEY_MAX {
        return f.write_str("/Max");
    }
    for &b in bytes {
        if (b.is_ascii_graphic() && b != b'\\') || b == b' ' {
            write!(f, "{}", b as char)?;
        } else {
            write!(f, "\\x{b:02x}")?;
        }
    }
    Ok(())
}

/// Key span of a request. An empty `end_key` denotes a single key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub key: Key,
    pub end_key: Key,
}

impl Span {
    pub const fn empty() -> Self {
        Self {
            key: Key::empty(),
            end_key: Key::empty(),
        }
    }

    pub fn point(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            end_key: Key::empty(),
        }
    }

    pub fn new(key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            end_key: end_key.into(),
        }
    }
}

/// Addressed span `[key, end_key)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RSpan {
    pub key: RKey,
    pub end_key: RKey,
}

impl RSpan {
    pub fn new(key: RKey, end_key: RKey) -> Self {
        Self { key, end_key }
    }

    /// `key <= k < end_key`.
    pub fn contains_key(&self, k: &RKey) -> bool {
        *k >= self.key && *k < self.end_key
    }

    /// `key < k <= end_key`: `k` used as an exclusive end key falls inside.
    pub fn contains_exclusive_end_key(&self, k: &RKey) -> bool {
        *k > self.key && *k <= self.end_key
    }

    /// Whether `[start, end)` lies within this span. An empty `end` checks
    /// only `start`.
    pub fn contains_key_range(&self, start: &RKey, end: &RKey) -> bool {
        if end.is_empty() || end == start {
            return self.contains_key(start);
        }
        if end < start {
            return false;
        }
        *start >= self.key && self.end_key >= *end
    }

    /// Restrict this span to the bounds of `desc`.
    pub fn intersect(&self, desc: &RangeDescriptor) -> Result<RSpan, KvError> {
        if self.key >= desc.end_key || desc.start_key >= self.end_key {
            return Err(KvError::Internal(format!(
                "span [{}, {}) and r{} [{}, {}) do not overlap",
                self.key, self.end_key, desc.range_id, desc.start_key, desc.end_key
            )));
        }
        let key = if self.key < desc.start_key {
            desc.start_key.clone()
        } else {
            self.key.clone()
        };
        let end_key = if self.end_key.is_empty()
            || !desc.contains_key_range(&desc.start_key, &self.end_key)
        {
            desc.end_key.clone()
        } else {
            self.end_key.clone()
        };
        Ok(RSpan { key, end_key })
    }
}

/// One replica of a range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(n{},s{}):{}",
            self.node_id, self.store_id, self.replica_id
        )
    }
}

/// Routing metadata for one range. Never mutated once published; a split,
/// merge or membership change produces a new descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: RKey,
    pub end_key: RKey,
    pub replicas: Vec<ReplicaDescriptor>,
}

impl RangeDescriptor {
    pub fn rspan(&self) -> RSpan {
        RSpan::new(self.start_key.clone(), self.end_key.clone())
    }

    pub fn contains_key(&self, k: &RKey) -> bool {
        self.rspan().contains_key(k)
    }

    pub fn contains_exclusive_end_key(&self, k: &RKey) -> bool {
        self.rspan().contains_exclusive_end_key(k)
    }

    pub fn contains_key_range(&self, start: &RKey, end: &RKey) -> bool {
        self.rspan().contains_key_range(start, end)
    }

    pub fn find_replica(&self, store_id: StoreId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.store_id == store_id)
    }
}

impl fmt::Display for RangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r{}:[{}-{})",
            self.range_id, self.start_key, self.end_key
        )
    }
}

/// Address and attributes of a node, as published through gossip.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub address: String,
    pub attrs: Vec<String>,
}

/// Hybrid-logical clock timestamp. Ordered by wall time, then logical.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub wall_time: i64,
    pub logical: i32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    pub const fn new(wall_time: i64, logical: i32) -> Self {
        Self { wall_time, logical }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Move forward to `other` if it is later. Returns whether it moved.
    pub fn forward(&mut self, other: Timestamp) -> bool {
        if other > *self {
            *self = other;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.wall_time, self.logical)
    }
}
