//! Key addressing and batch/span algebra.
//!
//! Everything here is pure: mapping raw keys to their address in the global
//! keyspace, locating meta records, and cutting a batch down to the part
//! that falls inside one range.

use holo_batch::{BatchRequest, Key, KvError, RKey, RSpan, RangeDescriptor, Request, KEY_MAX};

/// Prefix of all local (non-addressable) keys.
pub const LOCAL_PREFIX: &[u8] = b"\x01";
/// Prefix of local keys anchored to a global key (range-local data).
pub const LOCAL_RANGE_PREFIX: &[u8] = b"\x01k";
/// Prefix shared by both levels of range metadata.
pub const META_PREFIX: &[u8] = b"\x00\x00meta";
/// First level of range metadata: addresses meta2 ranges.
pub const META1_PREFIX: &[u8] = b"\x00\x00meta1";
/// Second level of range metadata: addresses user ranges.
pub const META2_PREFIX: &[u8] = b"\x00\x00meta2";
/// End of the metadata keyspace.
pub const META_MAX: &[u8] = b"\x00\x00meta3";

fn concat(prefix: &[u8], rest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + rest.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(rest);
    out
}

/// Meta1 record addressing the range that holds the end of meta2.
pub fn meta1_key_max() -> RKey {
    RKey(concat(META1_PREFIX, KEY_MAX))
}

/// Order-preserving byte encoding: `0x00` is escaped as `0x00 0xff` and the
/// value is terminated by `0x00 0x01`.
pub fn encode_bytes_ascending(buf: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        if b == 0 {
            buf.extend_from_slice(&[0x00, 0xff]);
        } else {
            buf.push(b);
        }
    }
    buf.extend_from_slice(&[0x00, 0x01]);
}

/// Inverse of `encode_bytes_ascending`. Returns the decoded value and the
/// remaining input.
pub fn decode_bytes_ascending(buf: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != 0 {
            out.push(buf[i]);
            i += 1;
            continue;
        }
        match buf.get(i + 1) {
            Some(0xff) => out.push(0),
            Some(0x01) => return Some((out, &buf[i + 2..])),
            _ => return None,
        }
        i += 2;
    }
    None
}

/// Prefix of every range-local key anchored at `key`.
pub fn make_range_key_prefix(key: &RKey) -> Key {
    let mut buf = LOCAL_RANGE_PREFIX.to_vec();
    encode_bytes_ascending(&mut buf, key.as_bytes());
    Key(buf)
}

/// Range-local key anchored at `key` with the given suffix.
pub fn make_range_key(key: &RKey, suffix: &[u8]) -> Key {
    let mut out = make_range_key_prefix(key);
    out.0.extend_from_slice(suffix);
    out
}

/// Address of `key` in the global keyspace.
pub fn addr(key: &Key) -> Result<RKey, KvError> {
    if !key.has_prefix(LOCAL_PREFIX) {
        return Ok(RKey(key.0.clone()));
    }
    if key.has_prefix(LOCAL_RANGE_PREFIX) {
        if let Some((anchor, _suffix)) = decode_bytes_ascending(&key.0[LOCAL_RANGE_PREFIX.len()..]) {
            return Ok(RKey(anchor));
        }
    }
    Err(KvError::InvalidBatch(format!(
        "local key {key} malformed; should not be used as address"
    )))
}

/// Meta record key under which the descriptor addressing `key` is found.
/// Returns `RKey::min()` for keys addressed by the first range itself.
pub fn range_meta_key(key: &RKey) -> RKey {
    if key.is_empty() || key.has_prefix(META1_PREFIX) {
        return RKey::min();
    }
    if key.has_prefix(META2_PREFIX) {
        return RKey(concat(META1_PREFIX, &key.as_bytes()[META2_PREFIX.len()..]));
    }
    RKey(concat(META2_PREFIX, key.as_bytes()))
}

/// Meta records that must point at `desc` for lookups to find it.
pub fn range_addressing_keys(desc: &RangeDescriptor) -> Vec<RKey> {
    let end = &desc.end_key;
    let mut keys = Vec::new();
    if end.has_prefix(META2_PREFIX) {
        keys.push(RKey(concat(META1_PREFIX, &end.as_bytes()[META2_PREFIX.len()..])));
    } else if !end.has_prefix(META_PREFIX) {
        keys.push(RKey(concat(META2_PREFIX, end.as_bytes())));
        if desc.start_key.is_empty() || desc.start_key.has_prefix(META2_PREFIX) {
            keys.push(meta1_key_max());
        }
    }
    keys
}

fn addr_end(req: &Request) -> Result<RKey, KvError> {
    let span = req.header();
    if span.end_key.is_empty() {
        return Ok(RKey::min());
    }
    addr(&span.end_key)
}

/// Smallest addressed span covering every non-noop request in `ba`.
pub fn batch_range(ba: &BatchRequest) -> Result<RSpan, KvError> {
    let mut from = RKey::max();
    let mut to = RKey::min();
    for req in &ba.requests {
        if matches!(req, Request::Noop) {
            continue;
        }
        let key = addr(&req.header().key)?;
        if key < from {
            from = key.clone();
        }
        if key >= to {
            to = key.next();
        }
        let end_key = addr_end(req)?;
        if to < end_key {
            to = end_key;
        }
    }
    Ok(RSpan::new(from, to))
}

/// Restrict every request in `ba` to `rs`. Requests left with nothing to do
/// become `Noop`. Returns the truncated batch and its number of non-noop
/// requests.
pub fn truncate(ba: &BatchRequest, rs: &RSpan) -> Result<(BatchRequest, usize), KvError> {
    let mut out = BatchRequest {
        header: ba.header.clone(),
        requests: Vec::with_capacity(ba.requests.len()),
    };
    let mut active = 0;
    for req in &ba.requests {
        match truncate_one(req, rs)? {
            Some(truncated) => {
                active += 1;
                out.requests.push(truncated);
            }
            None => out.requests.push(Request::Noop),
        }
    }
    Ok((out, active))
}

fn truncate_one(req: &Request, rs: &RSpan) -> Result<Option<Request>, KvError> {
    if matches!(req, Request::Noop) {
        return Ok(None);
    }
    let span = req.header();
    if !req.is_range() {
        if !span.end_key.is_empty() {
            return Err(KvError::InvalidBatch(format!(
                "{} is not a range command, but EndKey is set",
                req.method()
            )));
        }
        let key_addr = addr(&span.key)?;
        return Ok(rs.contains_key(&key_addr).then(|| req.clone()));
    }

    let key_addr = addr(&span.key)?;
    let end_addr = addr(&span.end_key)?;
    let start_local = key_addr.as_bytes() != span.key.as_bytes();
    let end_local = end_addr.as_bytes() != span.end_key.as_bytes();
    let local = start_local || end_local;
    if local {
        if !rs.contains_key_range(&key_addr, &end_addr) {
            return Err(KvError::InvalidBatch(
                "local key range must not span ranges".to_string(),
            ));
        }
        if !start_local || !end_local {
            return Err(KvError::InvalidBatch(
                "local key mixed with global key in range".to_string(),
            ));
        }
    }

    let mut key = span.key.clone();
    let mut end_key = span.end_key.clone();
    if key_addr < rs.key {
        key = if local {
            make_range_key_prefix(&rs.key)
        } else {
            rs.key.as_raw_key()
        };
    }
    if end_addr >= rs.end_key {
        end_key = if local {
            make_range_key_prefix(&rs.end_key)
        } else {
            rs.end_key.as_raw_key()
        };
    }
    if key >= end_key {
        return Ok(None);
    }
    if key == span.key && end_key == span.end_key {
        return Ok(Some(req.clone()));
    }
    let mut truncated = req.clone();
    if let Some(header) = truncated.header_mut() {
        header.key = key;
        header.end_key = end_key;
    }
    Ok(Some(truncated))
}

/// Right boundary of the requests in `ba` that lie entirely below `k`, or
/// `k` itself if some request straddles it. Used to step a reverse
/// traversal over gaps that no request touches.
pub fn prev(ba: &BatchRequest, k: &RKey) -> Result<RKey, KvError> {
    let mut candidate = RKey::min();
    for req in &ba.requests {
        if matches!(req, Request::Noop) {
            continue;
        }
        let key_addr = addr(&req.header().key)?;
        let mut end_addr = addr_end(req)?;
        if end_addr.is_empty() {
            end_addr = key_addr.next();
        }
        if end_addr >= *k {
            if *k >= key_addr {
                return Ok(k.clone());
            }
            continue;
        }
        if candidate < end_addr {
            candidate = end_addr;
        }
    }
    Ok(candidate)
}

/// Left boundary of the requests in `ba` that lie entirely at or above `k`,
/// or `k` itself if some request straddles it. Used to step a forward
/// traversal over gaps that no request touches.
pub fn next(ba: &BatchRequest, k: &RKey) -> Result<RKey, KvError> {
    let mut candidate = RKey::max();
    for req in &ba.requests {
        if matches!(req, Request::Noop) {
            continue;
        }
        let key_addr = addr(&req.header().key)?;
        if key_addr < *k {
            let end_addr = addr_end(req)?;
            if *k < end_addr {
                return Ok(k.clone());
            }
            continue;
        }
        if key_addr < candidate {
            candidate = key_addr;
        }
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use holo_batch::Method;

    fn rk(s: &str) -> RKey {
        RKey::from(s)
    }

    fn batch(requests: Vec<Request>) -> BatchRequest {
        BatchRequest::with_requests(requests)
    }

    #[test]
    fn bytes_encoding_preserves_order_and_round_trips() {
        let values: [&[u8]; 4] = [b"", b"a", b"a\x00", b"a\x00b"];
        let mut encoded: Vec<Vec<u8>> = Vec::new();
        for v in values {
            let mut buf = Vec::new();
            encode_bytes_ascending(&mut buf, v);
            buf.extend_from_slice(b"tail");
            let (decoded, rest) = decode_bytes_ascending(&buf).expect("decodes");
            assert_eq!(decoded, v);
            assert_eq!(rest, b"tail");
            encoded.push(buf);
        }
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(sorted, encoded);
        assert!(decode_bytes_ascending(b"ab\x00\x07").is_none());
    }

    #[test]
    fn local_range_keys_address_their_anchor() {
        let anchor = rk("user\x00key");
        let local = make_range_key(&anchor, b"txn-record");
        assert_eq!(addr(&local).expect("addressable"), anchor);
        assert_eq!(addr(&Key::from("plain")).expect("global"), rk("plain"));
        assert!(addr(&Key::from("\x01zzz")).is_err());
    }

    #[test]
    fn meta_keys_walk_up_the_hierarchy() {
        let user = rk("apple");
        let meta2 = range_meta_key(&user);
        assert_eq!(meta2.as_bytes(), b"\x00\x00meta2apple");
        let meta1 = range_meta_key(&meta2);
        assert_eq!(meta1.as_bytes(), b"\x00\x00meta1apple");
        assert_eq!(range_meta_key(&meta1), RKey::min());
        assert_eq!(range_meta_key(&RKey::min()), RKey::min());
    }

    #[test]
    fn addressing_records_for_first_and_user_ranges() {
        let first = RangeDescriptor {
            range_id: 1,
            start_key: RKey::min(),
            end_key: rk("m"),
            replicas: Vec::new(),
        };
        assert_eq!(
            range_addressing_keys(&first),
            vec![range_meta_key(&rk("m")), meta1_key_max()]
        );
        let user = RangeDescriptor {
            range_id: 2,
            start_key: rk("m"),
            end_key: RKey::max(),
            replicas: Vec::new(),
        };
        assert_eq!(
            range_addressing_keys(&user),
            vec![range_meta_key(&RKey::max())]
        );
    }

    #[test]
    fn batch_range_covers_points_and_spans() {
        let ba = batch(vec![
            Request::get("d"),
            Request::Noop,
            Request::scan("b", "c", 0),
            Request::put("x", "v"),
        ]);
        let rs = batch_range(&ba).expect("range");
        assert_eq!(rs, RSpan::new(rk("b"), rk("x").next()));
    }

    #[test]
    fn truncate_replaces_out_of_range_requests_with_noop() {
        let ba = batch(vec![
            Request::get("a"),
            Request::scan("b", "q", 0),
            Request::put("p", "v"),
        ]);
        let rs = RSpan::new(rk("c"), rk("h"));
        let (truncated, active) = truncate(&ba, &rs).expect("truncates");
        assert_eq!(active, 1);
        assert_eq!(truncated.requests[0].method(), Method::Noop);
        assert_eq!(truncated.requests[1].header().key, Key::from("c"));
        assert_eq!(truncated.requests[1].header().end_key, Key::from("h"));
        assert_eq!(truncated.requests[2].method(), Method::Noop);

        // The input batch is untouched.
        assert_eq!(ba.requests[1].header().key, Key::from("b"));
    }

    #[test]
    fn truncate_rejects_point_requests_with_end_keys() {
        let mut req = Request::get("a");
        if let Some(h) = req.header_mut() {
            h.end_key = Key::from("b");
        }
        let err = truncate(&batch(vec![req]), &RSpan::new(rk("a"), rk("z")))
            .expect_err("must fail");
        assert!(matches!(err, KvError::InvalidBatch(_)));
    }

    #[test]
    fn truncate_local_span_within_one_range() {
        let start = make_range_key(&rk("d"), b"a");
        let end = make_range_key(&rk("d"), b"z");
        let ba = batch(vec![Request::scan(start.clone(), end.clone(), 0)]);
        let (truncated, active) =
            truncate(&ba, &RSpan::new(rk("c"), rk("h"))).expect("truncates");
        assert_eq!(active, 1);
        assert_eq!(truncated.requests[0].header().key, start);
        assert_eq!(truncated.requests[0].header().end_key, end);
    }

    #[test]
    fn next_skips_gaps_forward() {
        let ba = batch(vec![Request::get("c"), Request::scan("f", "k", 0)]);
        assert_eq!(next(&ba, &rk("d")).expect("next"), rk("f"));
        assert_eq!(next(&ba, &rk("g")).expect("next"), rk("g"));
        assert_eq!(next(&ba, &rk("k")).expect("next"), RKey::max());
    }

    #[test]
    fn prev_skips_gaps_backward() {
        let ba = batch(vec![Request::get("c"), Request::scan("f", "k", 0)]);
        assert_eq!(prev(&ba, &rk("e")).expect("prev"), rk("c").next());
        assert_eq!(prev(&ba, &rk("g")).expect("prev"), rk("g"));
        assert_eq!(prev(&ba, &rk("a")).expect("prev"), RKey::min());
    }
}
